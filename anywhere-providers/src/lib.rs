use anyhow::Result;
use async_trait::async_trait;

pub mod wait;

/// Tag key carrying the owning record's uuid on every cloud resource we create.
pub const OWNER_TAG_KEY: &str = "uuid";

/// Compute capability of one cloud. Zones are the provider's placement
/// unit and map 1:1 to configured regions.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Short provider code ("scaleway", "mock"). Used in proxy outbound tags.
    fn code(&self) -> &'static str;

    /// Creates and boots one server. `owner_tag` is attached under
    /// [`OWNER_TAG_KEY`] so the server can be attributed later without local state.
    /// Returns the provider's server id.
    async fn create_instance(
        &self,
        zone: &str,
        instance_type: &str,
        image_id: &str,
        cloud_init: Option<&str>,
        owner_tag: &str,
    ) -> Result<String>;

    async fn terminate_instance(&self, zone: &str, server_id: &str) -> Result<bool>;

    async fn get_instance_ip(&self, zone: &str, server_id: &str) -> Result<Option<String>>;

    /// Current view of one server, `None` when the provider no longer knows it.
    async fn describe_instance(
        &self,
        zone: &str,
        server_id: &str,
    ) -> Result<Option<inventory::DiscoveredInstance>>;

    // For Reconciliation. Terminated servers are never part of the result.
    async fn list_instances(&self, zone: &str) -> Result<Vec<inventory::DiscoveredInstance>>;
}

pub mod inventory {
    use std::fmt;

    /// Provider-neutral lifecycle state of a server.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum CloudState {
        Pending,
        Running,
        Stopping,
        Stopped,
        ShuttingDown,
        Terminated,
        Unknown(String),
    }

    impl CloudState {
        /// States a server never comes back from on its own.
        pub fn is_terminal_failure(&self) -> bool {
            matches!(self, CloudState::ShuttingDown | CloudState::Terminated)
        }
    }

    impl fmt::Display for CloudState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                CloudState::Pending => f.write_str("pending"),
                CloudState::Running => f.write_str("running"),
                CloudState::Stopping => f.write_str("stopping"),
                CloudState::Stopped => f.write_str("stopped"),
                CloudState::ShuttingDown => f.write_str("shutting-down"),
                CloudState::Terminated => f.write_str("terminated"),
                CloudState::Unknown(s) => write!(f, "unknown({})", s),
            }
        }
    }

    #[derive(Clone, Debug)]
    pub struct DiscoveredInstance {
        pub provider_id: String,
        pub name: String,
        pub zone: String,
        pub state: CloudState,
        pub ip_address: Option<String>,
        /// Value of the ownership tag, if the server carries one.
        pub owner_tag: Option<String>,
        pub created_at: Option<String>,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "scaleway")]
pub mod scaleway;
