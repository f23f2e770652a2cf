//! Per-invocation step and usage accumulation.

use parking_lot::Mutex;
use sr_domain::event::{SkillEvent, SkillEventPayload};
use sr_domain::invocation::{InvocationKey, Step};
use sr_domain::usage::UsageItem;

/// Name given to output that arrives without a step reference.
pub const DEFAULT_STEP: &str = "default";

/// Collects the structured result of an invocation: per-step content and
/// tool calls from live events, and the usage items that drive billing.
pub trait ResultAggregator: Send + Sync {
    fn add_skill_event(&self, event: &SkillEvent);
    fn add_usage_item(&self, step: Option<&str>, item: UsageItem);
    fn get_steps(&self, key: &InvocationKey) -> Vec<Step>;
    fn usage_items(&self) -> Vec<UsageItem>;
    fn clear_cache(&self);
}

#[derive(Default)]
struct Inner {
    steps: Vec<Step>,
    usage: Vec<UsageItem>,
}

impl Inner {
    fn step_mut(&mut self, key: &InvocationKey, name: Option<&str>) -> &mut Step {
        let name = name.unwrap_or(DEFAULT_STEP);
        let idx = match self.steps.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.steps.push(Step {
                    result_id: key.result_id.clone(),
                    version: key.version,
                    name: name.to_owned(),
                    ..Default::default()
                });
                self.steps.len() - 1
            }
        };
        &mut self.steps[idx]
    }
}

/// In-memory [`ResultAggregator`] keeping steps in first-seen order.
pub struct StepAggregator {
    key: InvocationKey,
    inner: Mutex<Inner>,
}

impl StepAggregator {
    pub fn new(key: &InvocationKey) -> Self {
        Self {
            key: key.clone(),
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl ResultAggregator for StepAggregator {
    fn add_skill_event(&self, event: &SkillEvent) {
        let mut inner = self.inner.lock();
        match &event.payload {
            SkillEventPayload::Stream {
                content,
                reasoning_content,
                ..
            } => {
                let step = inner.step_mut(&self.key, event.step.as_deref());
                step.content.push_str(content);
                step.reasoning_content.push_str(reasoning_content);
            }
            SkillEventPayload::ToolCallStart { tool_call_id, .. } => {
                let step = inner.step_mut(&self.key, event.step.as_deref());
                if !step.tool_call_ids.contains(tool_call_id) {
                    step.tool_call_ids.push(tool_call_id.clone());
                }
            }
            _ => {}
        }
    }

    fn add_usage_item(&self, step: Option<&str>, item: UsageItem) {
        let mut inner = self.inner.lock();
        inner.step_mut(&self.key, step).usage.add(&item.usage);
        inner.usage.push(item);
    }

    fn get_steps(&self, key: &InvocationKey) -> Vec<Step> {
        if *key != self.key {
            return Vec::new();
        }
        self.inner.lock().steps.clone()
    }

    fn usage_items(&self) -> Vec<UsageItem> {
        self.inner.lock().usage.clone()
    }

    fn clear_cache(&self) {
        let mut inner = self.inner.lock();
        inner.steps.clear();
        inner.usage.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sr_domain::usage::TokenUsage;

    fn stream(key: &InvocationKey, step: Option<&str>, text: &str) -> SkillEvent {
        SkillEvent::new(
            key,
            step.map(str::to_owned),
            SkillEventPayload::Stream {
                message_id: "m".into(),
                content: text.into(),
                reasoning_content: String::new(),
            },
        )
    }

    #[test]
    fn groups_output_by_step_in_order() {
        let key = InvocationKey::new("r1", 1);
        let agg = StepAggregator::new(&key);
        agg.add_skill_event(&stream(&key, Some("plan"), "a"));
        agg.add_skill_event(&stream(&key, None, "x"));
        agg.add_skill_event(&stream(&key, Some("plan"), "b"));

        let steps = agg.get_steps(&key);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].name, "plan");
        assert_eq!(steps[0].content, "ab");
        assert_eq!(steps[1].name, DEFAULT_STEP);
        assert!(agg.get_steps(&InvocationKey::new("r1", 2)).is_empty());
    }

    #[test]
    fn tool_calls_recorded_once() {
        let key = InvocationKey::new("r1", 1);
        let agg = StepAggregator::new(&key);
        let start = SkillEvent::new(
            &key,
            None,
            SkillEventPayload::ToolCallStart {
                message_id: "m".into(),
                tool_call_id: "t1".into(),
                tool_name: "search".into(),
                input: serde_json::Value::Null,
            },
        );
        agg.add_skill_event(&start);
        agg.add_skill_event(&start);
        assert_eq!(agg.get_steps(&key)[0].tool_call_ids, vec!["t1".to_string()]);
    }

    #[test]
    fn usage_accumulates_per_step() {
        let key = InvocationKey::new("r1", 1);
        let agg = StepAggregator::new(&key);
        let item = UsageItem {
            model: "m".into(),
            provider: String::new(),
            rate_model: None,
            usage: TokenUsage::new(10, 5),
            estimated: false,
        };
        agg.add_usage_item(Some("s"), item.clone());
        agg.add_usage_item(Some("s"), item);
        assert_eq!(agg.usage_items().len(), 2);
        assert_eq!(agg.get_steps(&key)[0].usage, TokenUsage::new(20, 10));

        agg.clear_cache();
        assert!(agg.usage_items().is_empty());
        assert!(agg.get_steps(&key).is_empty());
    }
}
