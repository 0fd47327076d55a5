use std::time::Duration;

use tokio::time::Instant;

use crate::proto::google::spanner::v1 as proto;
use crate::{CallOptions, Connection, Error};

/// A Cloud Spanner session: the server-side context every request runs in.
///
/// A session runs at most one transaction at a time, unless it is multiplexed.
#[derive(Clone, Debug)]
pub struct Session {
    name: String,
    multiplexed: bool,
    creator_role: Option<String>,
    created: Instant,
    last_used: Instant,
}

impl Session {
    pub(crate) fn new(name: &str) -> Self {
        let now = Instant::now();
        Self {
            name: name.to_string(),
            multiplexed: false,
            creator_role: None,
            created: now,
            last_used: now,
        }
    }

    /// The full resource name of this session.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn multiplexed(&self) -> bool {
        self.multiplexed
    }

    /// The database role the session was created with, if any.
    pub fn creator_role(&self) -> Option<&str> {
        self.creator_role.as_deref()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Time elapsed since the session was last used for a request.
    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Keeps the session alive on the server by running `SELECT 1` in it.
    pub async fn ping(&mut self, connection: &mut dyn Connection) -> Result<(), Error> {
        connection
            .execute_sql(
                proto::ExecuteSqlRequest {
                    session: self.name.clone(),
                    sql: "SELECT 1".to_string(),
                    ..Default::default()
                },
                CallOptions::default(),
            )
            .await?;
        self.touch();
        Ok(())
    }

    pub async fn delete(self, connection: &mut dyn Connection) -> Result<(), Error> {
        connection
            .delete_session(
                proto::DeleteSessionRequest { name: self.name },
                CallOptions::default(),
            )
            .await
    }
}

impl From<proto::Session> for Session {
    fn from(value: proto::Session) -> Self {
        let mut session = Session::new(&value.name);
        session.multiplexed = value.multiplexed;
        session.creator_role = (!value.creator_role.is_empty()).then(|| value.creator_role);
        session
    }
}
