//! Built-in node kinds, one module per `<Mode>.<Kind>`.

pub mod pda;
pub mod calculate;
pub mod assess;
pub mod detect;
pub mod default_action;
pub mod sweep;
pub mod learn;

use std::sync::Arc;

use crate::executor::NodeRegistry;

/// Fill `registry` with the fixed dispatch table.
pub fn register_builtins(registry: &mut NodeRegistry) {
    registry.insert("V.PDA".into(), Arc::new(pda::PdaNode));
    registry.insert("V.Calculate".into(), Arc::new(calculate::CalculateNode));
    registry.insert("V.Assess".into(), Arc::new(assess::AssessNode));
    registry.insert("I.Detect".into(), Arc::new(detect::DetectNode));
    for mode in ["I", "B", "O", "V"] {
        registry.insert(format!("{mode}.Default"), Arc::new(default_action::DefaultNode));
    }
    registry.insert("B.Sweep".into(), Arc::new(sweep::SweepNode));
    registry.insert("B.Learn".into(), Arc::new(learn::LearnNode));
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use bus::EventBus;
    use parking_lot::Mutex;
    use serde_json::{Map, Value};

    use crate::{FlowContext, NodeExecutor};

    pub type Log = Arc<Mutex<Vec<(String, Value)>>>;

    pub fn executor() -> (NodeExecutor, Log) {
        let bus = EventBus::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        bus.on_any(move |e| l.lock().push((e.name.clone(), e.payload.clone())));
        (NodeExecutor::new(bus), log)
    }

    pub fn run(executor: &NodeExecutor, ctx: &FlowContext, node_type: &str, config: Value) -> Value {
        let node = executor.prepare("n1", node_type, "", &config).expect("valid config");
        executor.execute(&node, ctx).expect("node should succeed")
    }

    pub fn context(flow_id: &str) -> FlowContext {
        FlowContext::new(flow_id, true, Map::new())
    }

    pub fn event_names(log: &Log) -> Vec<String> {
        log.lock().iter().map(|(n, _)| n.clone()).collect()
    }
}
