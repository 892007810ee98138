pub mod postgres;

use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::SettingsError;
use crate::model::Settings;

pub trait SettingsStore: Send + Sync {
    fn get(&self) -> BoxFuture<'_, Result<Settings, Report<SettingsError>>>;

    /// One-time creation of the default settings row if none exists yet.
    /// Implementation-private: callers outside this module should not need
    /// to call it directly — the Supervisor invokes it once at startup.
    fn create_if_absent(&self) -> BoxFuture<'_, Result<(), Report<SettingsError>>>;
}
