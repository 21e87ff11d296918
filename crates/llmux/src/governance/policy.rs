use parking_lot::RwLock;

use crate::*;

pub const ACTION_USE: &str = "use";

pub fn model_object(model: &str) -> Strng {
	strng::format!("model:{model}")
}

pub fn key_subject(key_id: &str) -> Strng {
	strng::format!("key:{key_id}")
}

/// Role-object-action policy set. Rules are exact triples; `*` matches any
/// value in the object or action position.
#[derive(Default)]
pub struct PolicyEngine {
	rules: RwLock<HashSet<(Strng, Strng, Strng)>>,
}

impl PolicyEngine {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_policy(&self, subject: Strng, object: Strng, action: Strng) {
		self.rules.write().insert((subject, object, action));
	}

	pub fn remove_policy(&self, subject: &str, object: &str, action: &str) -> bool {
		self
			.rules
			.write()
			.remove(&(strng::new(subject), strng::new(object), strng::new(action)))
	}

	pub fn enforce(&self, subject: &str, object: &str, action: &str) -> bool {
		let rules = self.rules.read();
		rules.iter().any(|(s, o, a)| {
			s.as_str() == subject
				&& (o.as_str() == object || o.as_str() == "*")
				&& (a.as_str() == action || a.as_str() == "*")
		})
	}

	pub fn len(&self) -> usize {
		self.rules.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.rules.read().is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exact_match() {
		let engine = PolicyEngine::new();
		engine.add_policy(key_subject("k1"), model_object("gpt-4o"), strng::new(ACTION_USE));
		assert!(engine.enforce("key:k1", "model:gpt-4o", "use"));
		assert!(!engine.enforce("key:k1", "model:gpt-4o-mini", "use"));
		assert!(!engine.enforce("key:k2", "model:gpt-4o", "use"));
	}

	#[test]
	fn wildcard_object() {
		let engine = PolicyEngine::new();
		engine.add_policy(key_subject("admin"), strng::literal!("*"), strng::literal!("*"));
		assert!(engine.enforce("key:admin", "model:anything", "use"));
	}

	#[test]
	fn removal_revokes() {
		let engine = PolicyEngine::new();
		engine.add_policy(key_subject("k1"), model_object("m"), strng::new(ACTION_USE));
		assert!(engine.enforce("key:k1", "model:m", "use"));
		assert!(engine.remove_policy("key:k1", "model:m", "use"));
		assert!(!engine.enforce("key:k1", "model:m", "use"));
	}

	#[test]
	fn duplicate_policies_are_idempotent() {
		let engine = PolicyEngine::new();
		for _ in 0..3 {
			engine.add_policy(key_subject("k1"), model_object("m"), strng::new(ACTION_USE));
		}
		assert_eq!(engine.len(), 1);
	}
}
