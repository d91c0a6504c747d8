//! Manager facade (component I): the strictly-ordered init sequence of
//! §4.I, followed by handing off to the reactor loop.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, Signal, SigSet};

use crate::auth::PermittedCredentials;
use crate::config::Config;
use crate::link::Listener;
use crate::logger;
use crate::reactor::Reactor;
use crate::registry::Registry;

/// Everything the init sequence (§4.I steps 1-8) hands off to the
/// reactor loop.
pub struct Ready {
    pub reactor: Reactor,
    pub registry: Registry,
    pub permitted: PermittedCredentials,
    pub shutdown: Arc<AtomicBool>,
    pub default_buffer_size: u64,
}

pub struct Manager;

impl Manager {
    /// Run the init sequence (§4.I steps 1-8) and the reactor loop in
    /// one call, for callers that don't need to distinguish the two
    /// failure phases. `main.rs` instead calls `init` and `serve`
    /// separately, since they map to different exit codes.
    pub fn run(config: Config) -> Result<()> {
        let ready = Manager::init(config)?;
        Manager::serve(ready)
    }

    /// Steps 1-8: build the permitted-credential set, install the
    /// logger, bind the listening socket, ignore SIGPIPE, construct the
    /// reactor, log the startup banner, register SIGINT/SIGTERM, and
    /// daemonize if requested. Any failure here is a Manager init error,
    /// not a reactor-loop error (SPEC_FULL §4.I, §7).
    pub fn init(config: Config) -> Result<Ready> {
        // Steps 1-2: permitted credential sets and default buffer size
        // are already frozen into `config` by component J.
        let permitted = PermittedCredentials {
            uids: config.permitted_uids.clone(),
            gids: config.permitted_gids.clone(),
        };

        // Step 3: log sink.
        logger::init(&config.log_file_path, log::LevelFilter::Info)
            .context("initializing logger")?;

        // Step 4: listening socket.
        let socket_path = config.socket_path();
        let listener = Listener::bind(&socket_path)
            .with_context(|| format!("binding listening socket at {}", socket_path.display()))?;

        // Step 5: SIGPIPE -> ignore, so a broken client pipe surfaces as
        // a write error rather than killing the process (§4.F).
        ignore_sigpipe().context("installing SIGPIPE handler")?;

        // Step 6: register with the reactor.
        let reactor = Reactor::new(listener).context("constructing reactor")?;

        // Step 7: startup banner.
        info!(
            "smb_manager starting: vlan={} permitted_uids={:?} permitted_gids={:?} \
             default_buffer_size={} log_file={}",
            config.vlan,
            config.permitted_uids,
            config.permitted_gids,
            config.default_buffer_size,
            config.log_file_path,
        );

        // Step 8: orderly shutdown on SIGINT/SIGTERM (ambient addition,
        // §4.I.8) rather than the abrupt default process kill.
        let shutdown = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
            .context("registering SIGINT handler")?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
            .context("registering SIGTERM handler")?;

        if config.daemonize {
            nix::unistd::daemon(true, true).context("daemonizing")?;
        }

        Ok(Ready {
            reactor,
            registry: Registry::new(),
            permitted,
            shutdown,
            default_buffer_size: config.default_buffer_size,
        })
    }

    /// Run the reactor loop to completion. A failure here, and only
    /// here, is the exit-255 case (SPEC_FULL.md:157).
    pub fn serve(mut ready: Ready) -> Result<()> {
        ready.reactor.run(
            ready.default_buffer_size,
            &ready.permitted,
            &mut ready.registry,
            &ready.shutdown,
        )
    }
}

fn ignore_sigpipe() -> Result<(), nix::Error> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: installing a handler for SIGPIPE at process start, before
    // any other thread exists, is always sound.
    unsafe { sigaction(Signal::SIGPIPE, &action) }?;
    Ok(())
}
