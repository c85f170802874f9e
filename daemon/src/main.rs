use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use mediawatchd::config::{self, Cli};
use mediawatchd::eventloop::EventLoop;
use mediawatchd::remote::{self, RemoteClient};
use mediawatchd::{daemonize, logging};

const STARTUP_RETRY_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load(&cli).context("failed to load configuration")?;

    logging::init(&config).context("failed to initialize logging")?;

    if config.daemonize {
        daemonize::daemonize().context("failed to daemonize")?;
    }

    let remote = RemoteClient::new(config.plex_url.clone(), config.plex_token.clone())
        .context("failed to construct remote client")?;

    let libraries = fetch_libraries_with_retry(&remote, config.startup_timeout)?;

    let mut event_loop =
        EventLoop::new(remote, config.scan_interval).context("failed to start event loop")?;

    for library in &libraries {
        for path in &library.paths {
            event_loop.add_root(path, library.section_id);
        }
    }
    for extra in &config.extra_directories {
        event_loop.add_root(extra, 0);
    }

    info!(directories = event_loop.monitored_count(), "startup complete, monitoring directories");

    event_loop.run()?;
    event_loop.shutdown();

    info!("exiting");
    Ok(())
}

fn fetch_libraries_with_retry(
    remote: &RemoteClient,
    startup_timeout: Duration,
) -> anyhow::Result<Vec<remote::Library>> {
    let deadline = Instant::now() + startup_timeout;

    loop {
        match remote.get_libraries() {
            Ok(libraries) => return Ok(libraries),
            Err(e) => {
                if Instant::now() >= deadline {
                    error!(error = %e, "could not reach remote service within startup timeout");
                    anyhow::bail!("remote service unreachable after {:?}: {e}", startup_timeout);
                }
                error!(error = %e, "remote service unavailable, retrying");
                thread::sleep(STARTUP_RETRY_INTERVAL);
            }
        }
    }
}
