//! Auxiliary integrations (chat bridges and the like) that must be told
//! when the server goes down.

/// Error type integrations report.
pub type IntegrationError = Box<dyn std::error::Error + Send + Sync>;

/// Something outside the game protocol that holds a connection of its own.
pub trait Integration: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Disconnects, passing `reason` along where the remote end shows one.
    fn disconnect(&self, reason: &str) -> Result<(), IntegrationError>;
}
