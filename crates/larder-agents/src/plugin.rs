use larder_core::{LarderResult, Payload};

/// Hooks wrapped around every execution of an agent instance.
///
/// Plugins run in the order they were configured: `before_execute` on the
/// input before the agent sees it, `after_execute` on the output before it
/// leaves the instance. Both hooks default to no-ops. An error from either
/// hook fails the execution.
pub trait Plugin: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// May rewrite the input before the agent runs.
    fn before_execute(&self, _input: &mut Payload) -> LarderResult<()> {
        Ok(())
    }

    /// May rewrite the output after the agent returns.
    fn after_execute(&self, _output: &mut Payload) -> LarderResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    impl Plugin for Noop {
        fn name(&self) -> &str {
            "noop"
        }
    }

    #[test]
    fn test_default_hooks_leave_payload_alone() {
        let mut payload = json!({"text": "hi"}).as_object().cloned().unwrap();
        let before = payload.clone();
        Noop.before_execute(&mut payload).unwrap();
        Noop.after_execute(&mut payload).unwrap();
        assert_eq!(payload, before);
        assert_eq!(Noop.name(), "noop");
    }
}
