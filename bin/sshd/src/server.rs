//! SSH server wiring: password authentication against the user store,
//! then per-channel dispatch to the SFTP subsystem or an SCP exec
//! session. The transport itself (key exchange, channels, windowing) is
//! russh's business.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lattice_model::UserRecord;
use lattice_scp::{ScpCommand, ScpHandler, ScpSession};
use lattice_sftp::SftpHandler;
use lattice_store::{ProjectResolver, Stores};
use async_trait::async_trait;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId};
use tracing::{debug, error, info, warn};

pub struct Gateway {
    stores: Stores,
    fs_root: PathBuf,
    active: Arc<AtomicUsize>,
}

impl Gateway {
    pub fn new(stores: Stores, fs_root: PathBuf) -> Self {
        Gateway {
            stores,
            fs_root,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Live-session counter, for the shutdown grace window.
    pub fn active_sessions(&self) -> Arc<AtomicUsize> {
        self.active.clone()
    }
}

impl russh::server::Server for Gateway {
    type Handler = ClientSession;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> ClientSession {
        debug!(?peer, "new ssh connection");
        self.active.fetch_add(1, Ordering::SeqCst);
        ClientSession {
            stores: self.stores.clone(),
            fs_root: self.fs_root.clone(),
            user: None,
            resolver: None,
            channels: HashMap::new(),
            active: self.active.clone(),
        }
    }
}

/// One SSH connection. After password authentication the user record
/// and the session's project resolver are stashed here for every later
/// channel to pick up; the two per-session caches inside the resolver
/// are shared by all of the connection's SFTP and SCP activity.
pub struct ClientSession {
    stores: Stores,
    fs_root: PathBuf,
    user: Option<UserRecord>,
    resolver: Option<Arc<ProjectResolver>>,
    channels: HashMap<ChannelId, Channel<Msg>>,
    active: Arc<AtomicUsize>,
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl russh::server::Handler for ClientSession {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let record = match self.stores.users.get_user_by_slug(user).await {
            Ok(record) => record,
            Err(err) => {
                warn!(%user, %err, "login with unknown user slug");
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                });
            }
        };

        match bcrypt::verify(password, &record.password_hash) {
            Ok(true) => {
                info!(user = %record.slug, "authenticated");
                self.resolver = Some(Arc::new(ProjectResolver::new(
                    record.id,
                    self.stores.projects.clone(),
                )));
                self.user = Some(record);
                Ok(Auth::Accept)
            }
            Ok(false) => Ok(Auth::Reject {
                proceed_with_methods: None,
            }),
            Err(err) => {
                error!(%user, %err, "password verification failed");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            warn!(%name, "unsupported subsystem requested");
            session.channel_failure(channel_id);
            return Ok(());
        }

        let (Some(user), Some(resolver), Some(channel)) = (
            self.user.clone(),
            self.resolver.clone(),
            self.channels.remove(&channel_id),
        ) else {
            session.channel_failure(channel_id);
            return Ok(());
        };

        session.channel_success(channel_id);
        let handler = SftpHandler::new(user, self.stores.clone(), resolver, self.fs_root.clone());
        tokio::spawn(async move {
            russh_sftp::server::run(channel.into_stream(), handler).await;
        });
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let line = String::from_utf8_lossy(data).to_string();
        let cmd = match ScpCommand::parse(&line) {
            Ok(cmd) => cmd,
            Err(err) => {
                warn!(%line, %err, "rejecting exec request");
                session.channel_failure(channel_id);
                return Ok(());
            }
        };

        let (Some(user), Some(resolver), Some(channel)) = (
            self.user.clone(),
            self.resolver.clone(),
            self.channels.remove(&channel_id),
        ) else {
            session.channel_failure(channel_id);
            return Ok(());
        };

        session.channel_success(channel_id);
        let handler = ScpHandler::new(user, self.stores.clone(), resolver, self.fs_root.clone());
        let ssh = session.handle();
        tokio::spawn(async move {
            let scp = ScpSession::new(channel.into_stream(), handler);
            let status = match scp.run(cmd).await {
                Ok(()) => 0u32,
                Err(_) => 1u32,
            };
            let _ = ssh.exit_status_request(channel_id, status).await;
            let _ = ssh.eof(channel_id).await;
            let _ = ssh.close(channel_id).await;
        });
        Ok(())
    }
}
