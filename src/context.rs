//! # Runtime Context
//!
//! The outermost shell around a router: configure once, set up, run until
//! stopped. Exit codes follow the binary's contract: 0 for a clean stop,
//! 1 when run without configuration, 2 when the router failed to start.

use anyhow::{Context as _, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{Config, ConfigError};
use crate::router::Router;

/// OS signals the shell reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Hangup,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    pub show_banner: bool,
}

#[derive(Default)]
pub struct Context {
    config: Option<Config>,
    router: Option<Router>,
    join: Option<JoinHandle<()>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the configuration. Calling this twice is a hard error; a
    /// reconfiguration requires a fresh context.
    pub fn configure(&mut self, config: Config) -> Result<(), ConfigError> {
        if self.config.is_some() {
            return Err(ConfigError::AlreadyConfigured);
        }
        config.validate()?;
        self.config = Some(config);
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    /// Build and start the router. Requires a prior [`Self::configure`].
    pub async fn setup(&mut self, opts: &RuntimeOptions) -> Result<()> {
        let config = self
            .config
            .clone()
            .ok_or(ConfigError::NotConfigured)
            .map_err(anyhow::Error::new)?;
        if opts.show_banner {
            info!("umbra {}", env!("CARGO_PKG_VERSION"));
        }
        let (router, join) = Router::spawn(config)
            .await
            .context("failed to start router")?;
        self.router = Some(router);
        self.join = Some(join);
        Ok(())
    }

    /// Block until the router stops. Returns the process exit code.
    pub async fn run(&mut self) -> i32 {
        let Some(join) = self.join.take() else {
            error!("cannot run non configured context");
            return 1;
        };
        info!("running mainloop");
        if join.await.is_err() {
            error!("router loop aborted");
            return 2;
        }
        0
    }

    pub fn is_up(&self) -> bool {
        self.router.is_some()
    }

    pub fn router(&self) -> Option<&Router> {
        self.router.as_ref()
    }

    /// Post a clean shutdown onto the router loop.
    pub fn close_async(&self) {
        if let Some(router) = &self.router {
            router.stop();
        }
    }

    pub fn handle_signal(&self, signal: Signal) {
        match signal {
            Signal::Interrupt | Signal::Terminate => {
                info!(?signal, "stopping router");
                self.close_async();
            }
            Signal::Hangup => {
                // Reload is a placeholder until configuration is hot-swappable.
                info!("reload requested, nothing to do");
            }
        }
    }
}
