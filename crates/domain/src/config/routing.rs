use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolution of the virtual "auto" model.
///
/// A request for `auto_alias` executes on `default_model` but is billed at
/// the alias's rate. Without a `default_model` the alias passes through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "d_auto")]
    pub auto_alias: String,
    #[serde(default)]
    pub default_model: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            auto_alias: d_auto(),
            default_model: None,
        }
    }
}

impl RoutingConfig {
    /// Returns `(executed_model, rate_model)` for a requested model.
    pub fn resolve(&self, requested: &str) -> (String, Option<String>) {
        if requested == self.auto_alias {
            if let Some(ref target) = self.default_model {
                return (target.clone(), Some(self.auto_alias.clone()));
            }
        }
        (requested.to_owned(), None)
    }
}

fn d_auto() -> String {
    "auto".into()
}
