use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::types::{Role, UsageLog};
use crate::*;

#[derive(Debug, Clone, Default)]
pub struct KeyRecord {
	pub id: Strng,
	pub team_id: Option<Strng>,
	pub user_id: Option<Strng>,
	pub org_id: Option<Strng>,
	pub role: Role,
	pub max_budget: Option<f64>,
	pub spend: f64,
	pub model_max_budget: HashMap<Strng, f64>,
	pub model_spend: HashMap<Strng, f64>,
	/// Legacy allow-list. None or a `*` entry means every model.
	pub allowed_models: Option<Vec<Strng>>,
	pub rpm_limit: Option<u64>,
	pub burst: Option<u64>,
	pub blocked: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TeamRecord {
	pub id: Strng,
	pub max_budget: Option<f64>,
	pub spend: f64,
	pub model_max_budget: HashMap<Strng, f64>,
	pub model_spend: HashMap<Strng, f64>,
	pub rpm_limit: Option<u64>,
	pub burst: Option<u64>,
	pub blocked: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UserRecord {
	pub id: Strng,
	pub max_budget: Option<f64>,
	pub spend: f64,
	pub blocked: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OrgRecord {
	pub id: Strng,
	pub max_budget: Option<f64>,
	pub spend: f64,
	pub blocked: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EndUserRecord {
	pub id: Strng,
	pub max_budget: Option<f64>,
	pub spend: f64,
	pub blocked: bool,
}

/// One spend bucket to increment after a completed request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpendScope {
	Key(Strng),
	KeyModel(Strng, Strng),
	Team(Strng),
	TeamModel(Strng, Strng),
	User(Strng),
	TeamMembership { user: Strng, team: Strng },
	Org(Strng),
	OrgMembership { user: Strng, org: Strng },
	EndUser(Strng),
}

impl std::fmt::Display for SpendScope {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			SpendScope::Key(id) => write!(f, "api_key:{id}"),
			SpendScope::KeyModel(id, m) => write!(f, "api_key:{id}:model:{m}"),
			SpendScope::Team(id) => write!(f, "team:{id}"),
			SpendScope::TeamModel(id, m) => write!(f, "team:{id}:model:{m}"),
			SpendScope::User(id) => write!(f, "user:{id}"),
			SpendScope::TeamMembership { user, team } => write!(f, "membership:{user}:{team}"),
			SpendScope::Org(id) => write!(f, "organization:{id}"),
			SpendScope::OrgMembership { user, org } => write!(f, "org_membership:{user}:{org}"),
			SpendScope::EndUser(id) => write!(f, "end_user:{id}"),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("tenant store error: {0}")]
	Backend(String),
}

/// The narrow capability governance needs from persistent tenant state.
/// Lookups return deep copies; mutating a returned record never touches
/// store state.
#[async_trait]
pub trait TenantStore: Send + Sync {
	async fn get_key(&self, id: &str) -> Result<Option<KeyRecord>, StoreError>;
	async fn get_team(&self, id: &str) -> Result<Option<TeamRecord>, StoreError>;
	async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, StoreError>;
	async fn get_org(&self, id: &str) -> Result<Option<OrgRecord>, StoreError>;
	async fn get_end_user(&self, id: &str) -> Result<Option<EndUserRecord>, StoreError>;

	/// Atomically add `amount` to one spend bucket.
	async fn update_spend(&self, scope: &SpendScope, amount: f64) -> Result<(), StoreError>;

	async fn log_usage(&self, log: UsageLog) -> Result<(), StoreError>;

	/// Idempotency guard: true if the key was absent and is now claimed for
	/// `window`; false if a previous claim is still live.
	async fn put_if_absent(&self, key: &str, window: Duration) -> Result<bool, StoreError>;
}

/// Why a request was denied, attributed to the scope that denied it.
#[derive(Debug, Clone)]
pub struct AuditRecord {
	pub at: DateTime<Utc>,
	pub api_key_id: Strng,
	pub model: Strng,
	pub scope: Strng,
	pub reason: Strng,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
	async fn record(&self, record: AuditRecord);
}

/// In-process tenant store; the default backend and the test double.
#[derive(Default)]
pub struct MemoryTenantStore {
	keys: Mutex<HashMap<Strng, KeyRecord>>,
	teams: Mutex<HashMap<Strng, TeamRecord>>,
	users: Mutex<HashMap<Strng, UserRecord>>,
	orgs: Mutex<HashMap<Strng, OrgRecord>>,
	end_users: Mutex<HashMap<Strng, EndUserRecord>>,
	memberships: Mutex<HashMap<(Strng, Strng), f64>>,
	usage: Mutex<Vec<UsageLog>>,
	idempotency: Mutex<HashMap<String, Instant>>,
}

impl MemoryTenantStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn put_key(&self, record: KeyRecord) {
		self.keys.lock().insert(record.id.clone(), record);
	}
	pub fn put_team(&self, record: TeamRecord) {
		self.teams.lock().insert(record.id.clone(), record);
	}
	pub fn put_user(&self, record: UserRecord) {
		self.users.lock().insert(record.id.clone(), record);
	}
	pub fn put_org(&self, record: OrgRecord) {
		self.orgs.lock().insert(record.id.clone(), record);
	}
	pub fn put_end_user(&self, record: EndUserRecord) {
		self.end_users.lock().insert(record.id.clone(), record);
	}

	pub fn usage_logs(&self) -> Vec<UsageLog> {
		self.usage.lock().clone()
	}

	pub fn membership_spend(&self, user: &str, other: &str) -> Option<f64> {
		self
			.memberships
			.lock()
			.get(&(strng::new(user), strng::new(other)))
			.copied()
	}
}

#[async_trait]
impl TenantStore for MemoryTenantStore {
	async fn get_key(&self, id: &str) -> Result<Option<KeyRecord>, StoreError> {
		Ok(self.keys.lock().get(id).cloned())
	}
	async fn get_team(&self, id: &str) -> Result<Option<TeamRecord>, StoreError> {
		Ok(self.teams.lock().get(id).cloned())
	}
	async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, StoreError> {
		Ok(self.users.lock().get(id).cloned())
	}
	async fn get_org(&self, id: &str) -> Result<Option<OrgRecord>, StoreError> {
		Ok(self.orgs.lock().get(id).cloned())
	}
	async fn get_end_user(&self, id: &str) -> Result<Option<EndUserRecord>, StoreError> {
		Ok(self.end_users.lock().get(id).cloned())
	}

	async fn update_spend(&self, scope: &SpendScope, amount: f64) -> Result<(), StoreError> {
		match scope {
			SpendScope::Key(id) => {
				if let Some(k) = self.keys.lock().get_mut(id) {
					k.spend += amount;
				}
			},
			SpendScope::KeyModel(id, model) => {
				if let Some(k) = self.keys.lock().get_mut(id) {
					*k.model_spend.entry(model.clone()).or_default() += amount;
				}
			},
			SpendScope::Team(id) => {
				if let Some(t) = self.teams.lock().get_mut(id) {
					t.spend += amount;
				}
			},
			SpendScope::TeamModel(id, model) => {
				if let Some(t) = self.teams.lock().get_mut(id) {
					*t.model_spend.entry(model.clone()).or_default() += amount;
				}
			},
			SpendScope::User(id) => {
				if let Some(u) = self.users.lock().get_mut(id) {
					u.spend += amount;
				}
			},
			SpendScope::TeamMembership { user, team } => {
				*self
					.memberships
					.lock()
					.entry((user.clone(), team.clone()))
					.or_default() += amount;
			},
			SpendScope::Org(id) => {
				if let Some(o) = self.orgs.lock().get_mut(id) {
					o.spend += amount;
				}
			},
			SpendScope::OrgMembership { user, org } => {
				*self
					.memberships
					.lock()
					.entry((user.clone(), org.clone()))
					.or_default() += amount;
			},
			SpendScope::EndUser(id) => {
				if let Some(e) = self.end_users.lock().get_mut(id) {
					e.spend += amount;
				}
			},
		}
		Ok(())
	}

	async fn log_usage(&self, log: UsageLog) -> Result<(), StoreError> {
		self.usage.lock().push(log);
		Ok(())
	}

	async fn put_if_absent(&self, key: &str, window: Duration) -> Result<bool, StoreError> {
		let now = Instant::now();
		let mut map = self.idempotency.lock();
		map.retain(|_, expires| *expires > now);
		if map.contains_key(key) {
			return Ok(false);
		}
		map.insert(key.to_string(), now + window);
		Ok(true)
	}
}

/// Audit sink that retains records in memory; the default when no external
/// sink is wired up.
#[derive(Default)]
pub struct MemoryAuditSink {
	records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn records(&self) -> Vec<AuditRecord> {
		self.records.lock().clone()
	}
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
	async fn record(&self, record: AuditRecord) {
		self.records.lock().push(record);
	}
}
