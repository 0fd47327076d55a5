use std::sync::Arc;

use derive_builder::Builder;

use crate::connection::grpc::{connect, ConnectOptions};
use crate::proto::google::spanner::v1 as proto;
use crate::{
    Backoff, CallHook, Client, DatabaseId, Error, InstanceId, ResumePolicy, SessionPoolConfig,
};

const EMULATOR_HOST: &str = "SPANNER_EMULATOR_HOST";
const OPTIMIZER_VERSION: &str = "SPANNER_OPTIMIZER_VERSION";
const OPTIMIZER_STATISTICS_PACKAGE: &str = "SPANNER_OPTIMIZER_STATISTICS_PACKAGE";

/// How requests are authenticated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Credentials {
    /// Google's [Application Default Credentials](https://cloud.google.com/docs/authentication/production), as
    /// resolved by [`gcp_auth`].
    ApplicationDefault,
    /// No authentication, e.g. when talking to the emulator.
    Anonymous,
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials::ApplicationDefault
    }
}

/// Options sent with every query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub optimizer_version: Option<String>,
    pub optimizer_statistics_package: Option<String>,
}

impl QueryOptions {
    pub(crate) fn to_proto(&self) -> Option<proto::execute_sql_request::QueryOptions> {
        if self.optimizer_version.is_none() && self.optimizer_statistics_package.is_none() {
            return None;
        }
        Some(proto::execute_sql_request::QueryOptions {
            optimizer_version: self.optimizer_version.clone().unwrap_or_default(),
            optimizer_statistics_package: self
                .optimizer_statistics_package
                .clone()
                .unwrap_or_default(),
        })
    }
}

/// Configuration of a [`Client`], see [`Client::configure`].
///
/// The `SPANNER_EMULATOR_HOST` environment variable redirects the client to an emulator, without authentication
/// nor TLS. `SPANNER_OPTIMIZER_VERSION` and `SPANNER_OPTIMIZER_STATISTICS_PACKAGE` override the corresponding
/// [`QueryOptions`].
#[derive(Builder, Clone)]
#[builder(pattern = "owned")]
pub struct Config {
    #[builder(setter(into))]
    pub project: String,
    #[builder(setter(into))]
    pub instance: String,
    #[builder(setter(into))]
    pub database: String,

    /// The URI of the Cloud Spanner API, defaults to `https://spanner.googleapis.com`.
    #[builder(setter(into, strip_option), default)]
    pub endpoint: Option<String>,

    #[builder(default)]
    pub credentials: Credentials,

    #[builder(default = "true")]
    pub tls: bool,

    #[builder(default)]
    pub query_options: QueryOptions,

    #[builder(default)]
    pub pool: SessionPoolConfig,

    /// Backoff of retried RPCs and aborted transactions.
    #[builder(default)]
    pub retry: Backoff,

    /// Route read-write requests to the leader region of the database.
    #[builder(default = "true")]
    pub route_to_leader_enabled: bool,

    /// Database role that sessions are created with, for fine-grained access control.
    #[builder(setter(into, strip_option), default)]
    pub database_role: Option<String>,

    #[builder(default)]
    pub stream_resume: ResumePolicy,

    #[builder(setter(custom), default)]
    pub hooks: Vec<Arc<dyn CallHook>>,
}

impl ConfigBuilder {
    /// Registers a hook run around every RPC, after the ones registered before it.
    pub fn hook<H: CallHook + 'static>(mut self, hook: H) -> Self {
        self.hooks
            .get_or_insert_with(Vec::new)
            .push(Arc::new(hook));
        self
    }

    /// Builds the configuration and connects the [`Client`].
    pub async fn connect(self) -> Result<Client, Error> {
        let config = self
            .build()
            .map_err(|err| Error::Config(err.to_string()))?;
        Client::connect(config).await
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn database_id(&self) -> DatabaseId {
        DatabaseId::new(InstanceId::new(&self.project, &self.instance), &self.database)
    }

    /// Applies the environment variables understood by the client.
    pub(crate) fn apply_environment<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var(EMULATOR_HOST).filter(|host| !host.is_empty()) {
            let host = match host
                .strip_prefix("http://")
                .or_else(|| host.strip_prefix("https://"))
            {
                Some(stripped) => {
                    log::warn!(
                        "{} should be a host and port, ignoring the scheme of {}",
                        EMULATOR_HOST,
                        host
                    );
                    stripped.to_string()
                }
                None => host,
            };
            self.endpoint = Some(format!("http://{}", host));
            self.credentials = Credentials::Anonymous;
            self.tls = false;
        }
        if let Some(version) = var(OPTIMIZER_VERSION) {
            self.query_options.optimizer_version = Some(version);
        }
        if let Some(package) = var(OPTIMIZER_STATISTICS_PACKAGE) {
            self.query_options.optimizer_statistics_package = Some(package);
        }
    }

    pub(crate) async fn connect_options(&self) -> Result<ConnectOptions, Error> {
        let auth = match self.credentials {
            Credentials::ApplicationDefault => Some(gcp_auth::AuthenticationManager::new().await?),
            Credentials::Anonymous => None,
        };
        Ok(ConnectOptions {
            endpoint: self.endpoint.clone(),
            tls: self.tls,
            auth,
            database: self.database_id(),
            backoff: self.retry.clone(),
            route_to_leader_enabled: self.route_to_leader_enabled,
            hooks: self.hooks.clone(),
        })
    }

    pub(crate) async fn open_connection(&self) -> Result<Box<dyn crate::Connection>, Error> {
        connect(self.connect_options().await?).await
    }
}
