//! Thin wrapper around a russh client session.
//!
//! One session per VM connection; commands run on fresh exec channels. The
//! host key is accepted blindly — the VMs here are created moments earlier by
//! the same test run, so there is no prior knowledge to pin against.

use crate::error::{self, Result};
use crate::{CommandOutput, VmInfo};
use async_trait::async_trait;
use log::trace;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use snafu::{ensure, OptionExt, ResultExt};
use std::sync::Arc;

pub(crate) struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<(Self, bool), Self::Error> {
        Ok((self, true))
    }
}

pub(crate) struct SshSession {
    handle: Handle<AcceptingHandler>,
    vm: String,
}

impl SshSession {
    pub(crate) async fn connect(vm: &str, info: &VmInfo) -> Result<Self> {
        info.validate(vm)?;

        let key_text = std::str::from_utf8(&info.private_key)
            .ok()
            .context(error::PrivateKeyEncodingSnafu { vm })?;
        let keypair =
            russh_keys::decode_secret_key(key_text, None).context(error::KeyParseSnafu { vm })?;

        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(
            config,
            (info.host.as_str(), info.port),
            AcceptingHandler,
        )
        .await
        .context(error::ConnectSnafu {
            host: &info.host,
            port: info.port,
        })?;

        let authenticated = handle
            .authenticate_publickey(info.user.clone(), Arc::new(keypair))
            .await
            .context(error::SessionSnafu { vm })?;
        ensure!(
            authenticated,
            error::AuthRejectedSnafu {
                user: &info.user,
                host: &info.host,
            }
        );

        Ok(Self {
            handle,
            vm: vm.to_string(),
        })
    }

    /// Runs one command on a fresh exec channel and collects its output.
    pub(crate) async fn exec(&self, command: &str) -> Result<CommandOutput> {
        trace!("VM '{}': exec: {}", self.vm, command);
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .context(error::SessionSnafu { vm: &self.vm })?;
        channel
            .exec(true, command)
            .await
            .context(error::SessionSnafu { vm: &self.vm })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }
        let exit_status = exit_status.context(error::NoExitStatusSnafu { vm: &self.vm })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    pub(crate) async fn disconnect(self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}
