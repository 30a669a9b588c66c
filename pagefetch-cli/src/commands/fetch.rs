//! The `fetch` subcommand: drive the download pipeline against real HTTP.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use clap::{Args, ValueEnum};
use tracing::debug;

use pagefetch::transport::{HttpTransport, HttpTransportConfig};
use pagefetch::{
    CacheMode, FetchOutcome, Pipeline, PipelineConfig, Priority, ResourceId, TaskState,
};

use crate::error::CliError;

/// Cache policy selection for CLI arguments.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum CacheModeArg {
    /// Serve from cache when a complete entry exists, fetch otherwise
    Normal,
    /// Prefer cached content even when it is stale
    Always,
    /// Bypass any cached entry and re-download
    Reload,
    /// Fetch without leaving a cache entry behind
    Never,
}

impl From<CacheModeArg> for CacheMode {
    fn from(arg: CacheModeArg) -> Self {
        match arg {
            CacheModeArg::Normal => CacheMode::Normal,
            CacheModeArg::Always => CacheMode::AlwaysCache,
            CacheModeArg::Reload => CacheMode::ForceReload,
            CacheModeArg::Never => CacheMode::NeverCache,
        }
    }
}

/// Scheduling priority selection for CLI arguments.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum PriorityArg {
    /// Background transfer
    Low,
    /// Ordinary document fetch
    Main,
    /// Ahead of everything else
    High,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::LOW,
            PriorityArg::Main => Priority::MAIN,
            PriorityArg::High => Priority::HIGH,
        }
    }
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// URLs to fetch
    #[arg(required = true)]
    urls: Vec<String>,

    /// Cache policy
    #[arg(long, value_enum, default_value_t = CacheModeArg::Normal)]
    cache_mode: CacheModeArg,

    /// Scheduling priority
    #[arg(long, value_enum, default_value_t = PriorityArg::Main)]
    priority: PriorityArg,

    /// Concurrent connections per host
    #[arg(long, default_value_t = 4)]
    connections: usize,

    /// Print response headers before each body
    #[arg(long)]
    headers: bool,

    /// Username for authentication challenges
    #[arg(long, requires = "password")]
    user: Option<String>,

    /// Password for authentication challenges
    #[arg(long, requires = "user")]
    password: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 300)]
    timeout: u64,
}

struct Completion {
    url: String,
    head: Option<String>,
    body: Vec<u8>,
    error: Option<String>,
}

pub fn run(args: FetchArgs) -> Result<(), CliError> {
    let (transport, events) = HttpTransport::new(HttpTransportConfig {
        timeout: Duration::from_secs(args.timeout),
        ..HttpTransportConfig::default()
    });
    let mut pipeline = Pipeline::new(
        transport,
        PipelineConfig {
            connections_per_host: args.connections,
            ..PipelineConfig::default()
        },
    );

    let results: Rc<RefCell<Vec<Completion>>> = Rc::default();
    let mut handles = Vec::new();
    for url in &args.urls {
        let uri = ResourceId::parse(url)?;
        let results = Rc::clone(&results);
        let url = url.clone();
        let handle = pipeline.fetch(
            uri,
            args.priority.into(),
            args.cache_mode.into(),
            Box::new(move |entry, outcome| {
                let completion = match outcome {
                    FetchOutcome::Finished => Completion {
                        url,
                        head: entry.head(),
                        body: entry.content(),
                        error: None,
                    },
                    FetchOutcome::Failed(e) => Completion {
                        url,
                        head: None,
                        body: Vec::new(),
                        error: Some(e.to_string()),
                    },
                    FetchOutcome::Cancelled => Completion {
                        url,
                        head: None,
                        body: Vec::new(),
                        error: Some("cancelled".to_string()),
                    },
                };
                results.borrow_mut().push(completion);
            }),
        );
        handles.push(handle);
    }
    pipeline.step();

    while pipeline.has_tasks() {
        // Resolve credential prompts before waiting on the wire again.
        for handle in &handles {
            if pipeline.task_state(handle) != Some(TaskState::AuthChallenge) {
                continue;
            }
            let Some(scope) = pipeline.pending_challenge(handle) else {
                continue;
            };
            match (&args.user, &args.password) {
                (Some(user), Some(password)) => {
                    debug!(host = %scope.host, realm = %scope.realm, "supplying credentials");
                    pipeline.auth_mut().set_credentials(&scope, user, password);
                    pipeline.resume_auth(handle)?;
                }
                _ => {
                    return Err(CliError::AuthRequired(format!(
                        "{}:{} (realm \"{}\")",
                        scope.host, scope.port, scope.realm
                    )));
                }
            }
        }
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok((task, event)) => pipeline.handle_event(task, event),
            Err(RecvTimeoutError::Timeout) => pipeline.step(),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    pipeline.step();

    let stats = pipeline.registry().stats();
    debug!(
        hits = stats.hits,
        misses = stats.misses,
        entries = stats.entry_count,
        bytes = stats.size_bytes,
        "cache after run"
    );

    let results = results.borrow();
    let mut failed = 0usize;
    for completion in results.iter() {
        if let Some(error) = &completion.error {
            failed += 1;
            eprintln!("{}: {}", completion.url, error);
            continue;
        }
        if args.headers {
            if let Some(head) = &completion.head {
                print!("{head}");
                println!();
            }
        }
        io::stdout().write_all(&completion.body)?;
    }

    if failed > 0 {
        return Err(CliError::Fetch(format!(
            "{failed} of {} fetches failed",
            results.len()
        )));
    }
    Ok(())
}
