//! Stage registry - maps stages to handlers and restriction profiles

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::{
    AnalyzingStageHandler, BuildingStageHandler, CompleteStageHandler, CycleEndStageHandler, PlanningStageHandler,
    Stage, StageHandler, StageRestrictions, TestingStageHandler,
};

/// Registry for stage handlers
///
/// Handlers are built lazily and cached. Restriction profiles may be
/// overridden from configuration; when an override exists, config wins
/// over the handler's built-in profile. Custom handlers can be wired in
/// code via [`StageRegistry::register_handler`].
pub struct StageRegistry {
    handlers: Mutex<HashMap<Stage, Arc<dyn StageHandler>>>,
    restriction_overrides: HashMap<Stage, StageRestrictions>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            restriction_overrides: HashMap::new(),
        }
    }

    /// Create a registry with per-stage restriction overrides
    pub fn with_overrides(overrides: HashMap<Stage, StageRestrictions>) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            restriction_overrides: overrides,
        }
    }

    /// Parse a stage name, falling back to PLANNING on unknown names
    pub fn resolve(&self, stage_name: &str) -> Stage {
        if stage_name.is_empty() {
            warn!("Empty stage name, defaulting to PLANNING");
            return Stage::Planning;
        }
        match Stage::from_str(stage_name) {
            Ok(stage) => stage,
            Err(_) => {
                warn!(%stage_name, "Unknown stage name, defaulting to PLANNING");
                Stage::Planning
            }
        }
    }

    /// Get the handler for a stage, instantiating and caching on first use
    pub fn get_handler(&self, stage: Stage) -> Arc<dyn StageHandler> {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(stage)
            .or_insert_with(|| {
                debug!(%stage, "Instantiating stage handler");
                default_handler(stage)
            })
            .clone()
    }

    /// Register a custom handler for a stage, replacing the default
    pub fn register_handler(&self, stage: Stage, handler: Arc<dyn StageHandler>) {
        info!(%stage, "Registered custom stage handler");
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.insert(stage, handler);
    }

    /// Restrictions for a stage - config override first, then the handler
    pub fn get_restrictions(&self, stage: Stage) -> StageRestrictions {
        if let Some(overridden) = self.restriction_overrides.get(&stage) {
            debug!(%stage, "Using configured restriction override");
            return overridden.clone();
        }
        self.get_handler(stage).get_restrictions()
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn default_handler(stage: Stage) -> Arc<dyn StageHandler> {
    match stage {
        Stage::Planning => Arc::new(PlanningStageHandler),
        Stage::Building => Arc::new(BuildingStageHandler),
        Stage::Testing => Arc::new(TestingStageHandler),
        Stage::Analyzing => Arc::new(AnalyzingStageHandler),
        Stage::CycleEnd => Arc::new(CycleEndStageHandler),
        Stage::Complete => Arc::new(CompleteStageHandler),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_stages_have_handlers() {
        let registry = StageRegistry::new();
        for stage in Stage::ALL {
            let handler = registry.get_handler(stage);
            assert_eq!(handler.stage(), stage);
        }
    }

    #[test]
    fn test_handlers_are_cached() {
        let registry = StageRegistry::new();
        let a = registry.get_handler(Stage::Planning);
        let b = registry.get_handler(Stage::Planning);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_resolve_unknown_falls_back_to_planning() {
        let registry = StageRegistry::new();
        assert_eq!(registry.resolve("SHIPPING"), Stage::Planning);
        assert_eq!(registry.resolve(""), Stage::Planning);
        assert_eq!(registry.resolve("building"), Stage::Building);
    }

    #[test]
    fn test_restriction_override_wins() {
        let mut overrides = HashMap::new();
        overrides.insert(
            Stage::Building,
            StageRestrictions {
                allow_bash: false,
                allowed_write_paths: vec!["*/sandbox/*".to_string()],
                ..Default::default()
            },
        );
        let registry = StageRegistry::with_overrides(overrides);

        let building = registry.get_restrictions(Stage::Building);
        assert!(!building.allow_bash);
        assert_eq!(building.allowed_write_paths, vec!["*/sandbox/*"]);

        // Stages without an override keep the handler's profile
        let testing = registry.get_restrictions(Stage::Testing);
        assert!(testing.allow_bash);
    }

    #[test]
    fn test_register_custom_handler_replaces_default() {
        struct CustomPlanning;
        impl StageHandler for CustomPlanning {
            fn stage(&self) -> Stage {
                Stage::Planning
            }
            fn get_prompt(&self, _ctx: &super::super::StageContext) -> String {
                "custom".to_string()
            }
            fn process_response(
                &self,
                _reply: &serde_json::Value,
                _ctx: &super::super::StageContext,
            ) -> Result<super::super::StageResult, super::super::StageError> {
                Ok(super::super::StageResult::new(true, Stage::Building, "custom"))
            }
            fn get_restrictions(&self) -> StageRestrictions {
                StageRestrictions::default()
            }
        }

        let registry = StageRegistry::new();
        registry.register_handler(Stage::Planning, Arc::new(CustomPlanning));

        let ctx = crate::stages::test_support::context_for(Stage::Planning);
        assert_eq!(registry.get_handler(Stage::Planning).get_prompt(&ctx), "custom");
    }
}
