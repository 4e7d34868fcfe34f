//! Crate-level error types for asking entities and reading their state.
//!
//! Business rejections are never errors here: they travel back as reply
//! values. These errors only describe the command not getting through.

/// Error returned when a command could not be answered.
#[derive(Debug, thiserror::Error)]
pub enum AskError {
    /// The entity task is not running.
    ///
    /// It passivated or stopped before the command could be queued. The
    /// command was not processed; an [`EntityStore`](crate::EntityStore)
    /// re-spawns the entity on the next call.
    #[error("entity is no longer running")]
    EntityGone,

    /// The entity dropped the command without replying.
    ///
    /// Happens when persisting the command's event failed (or recovery
    /// failed). The event may or may not have been written; the entity has
    /// stopped and recovers from the journal on its next access.
    #[error("entity stopped before replying")]
    NoReply,

    /// The entity id is empty.
    #[error("entity id must not be empty")]
    InvalidEntityId,
}

/// Error returned when reading the current state of an entity fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The entity task has exited, so its state can no longer be queried.
    #[error("entity is no longer running")]
    EntityGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ask_error_display() {
        assert_eq!(AskError::EntityGone.to_string(), "entity is no longer running");
        assert_eq!(AskError::NoReply.to_string(), "entity stopped before replying");
        assert_eq!(
            AskError::InvalidEntityId.to_string(),
            "entity id must not be empty"
        );
    }

    #[test]
    fn state_error_entity_gone_display() {
        assert_eq!(StateError::EntityGone.to_string(), "entity is no longer running");
    }

    // Errors cross task boundaries through tokio channels.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<AskError>();
            assert_send_sync::<StateError>();
        }
    };
}
