use std::sync::RwLock;

use crate::types::{Deployment, DeploymentConfig};
use crate::*;

/// Maps logical model names to the deployments serving them. Read-dominant:
/// readers take a short shared lock and clone the slice out, so selection
/// never runs under the lock.
#[derive(Default)]
pub struct Registry {
	inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
	// Insertion order within a model is preserved; callers may rely on it for
	// deterministic tie-breaks when weights and stats are all equal.
	by_model: HashMap<Strng, Vec<Entry>>,
	by_id: HashMap<Strng, Strng>,
}

#[derive(Clone)]
pub struct Entry {
	pub deployment: Arc<Deployment>,
	pub config: DeploymentConfig,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&self, deployment: Deployment, config: DeploymentConfig) {
		let model = deployment.logical_model();
		let id = deployment.id.clone();
		let entry = Entry {
			deployment: Arc::new(deployment),
			config,
		};
		let mut inner = self.inner.write().expect("registry lock poisoned");
		// Re-registering an id under the same model replaces it in place so
		// insertion order survives config reloads.
		if let Some(prev_model) = inner.by_id.get(&id).cloned() {
			if prev_model == model {
				if let Some(entries) = inner.by_model.get_mut(&prev_model) {
					if let Some(slot) = entries.iter_mut().find(|e| e.deployment.id == id) {
						*slot = entry;
						return;
					}
				}
			}
			if let Some(entries) = inner.by_model.get_mut(&prev_model) {
				entries.retain(|e| e.deployment.id != id);
				if entries.is_empty() {
					inner.by_model.remove(&prev_model);
				}
			}
		}
		inner.by_id.insert(id, model.clone());
		inner.by_model.entry(model).or_default().push(entry);
	}

	pub fn remove(&self, id: &str) -> Option<Arc<Deployment>> {
		let mut inner = self.inner.write().expect("registry lock poisoned");
		let model = inner.by_id.remove(id)?;
		let entries = inner.by_model.get_mut(&model)?;
		let pos = entries.iter().position(|e| e.deployment.id.as_str() == id)?;
		let removed = entries.remove(pos);
		if entries.is_empty() {
			inner.by_model.remove(&model);
		}
		Some(removed.deployment)
	}

	/// Snapshot of the deployments serving a logical model.
	pub fn list(&self, model: &str) -> Vec<Entry> {
		let inner = self.inner.read().expect("registry lock poisoned");
		inner.by_model.get(model).cloned().unwrap_or_default()
	}

	pub fn get(&self, id: &str) -> Option<Entry> {
		let inner = self.inner.read().expect("registry lock poisoned");
		let model = inner.by_id.get(id)?;
		inner
			.by_model
			.get(model)?
			.iter()
			.find(|e| e.deployment.id.as_str() == id)
			.cloned()
	}

	/// All logical model names, sorted for stable listing.
	pub fn models(&self) -> Vec<Strng> {
		let inner = self.inner.read().expect("registry lock poisoned");
		let mut models: Vec<Strng> = inner.by_model.keys().cloned().collect();
		models.sort();
		models
	}

	pub fn deployment_ids(&self) -> Vec<Strng> {
		let inner = self.inner.read().expect("registry lock poisoned");
		inner.by_id.keys().cloned().collect()
	}
}

/// Reconcile the registry with a config snapshot: register new or changed
/// deployments, tear down removed ones together with their stats. A reload
/// whose deployment set is unchanged is observationally a no-op.
pub async fn sync_deployments(
	registry: &Registry,
	stats: &dyn crate::stats::StatsStore,
	specs: &[crate::config::DeploymentSpec],
) {
	let desired: HashSet<Strng> = specs.iter().map(|s| s.deployment.id.clone()).collect();
	for id in registry.deployment_ids() {
		if !desired.contains(&id) {
			registry.remove(&id);
			if let Err(e) = stats.delete_stats(&id).await {
				warn!(deployment = %id, err = %e, "failed to delete stats for removed deployment");
			}
		}
	}
	for spec in specs {
		registry.add(spec.deployment.clone(), spec.config.clone());
	}
}
