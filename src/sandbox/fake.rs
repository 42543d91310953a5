//! Scripted sandbox for unit tests
//!
//! Boxes keep their files in memory. Commands are answered by a handler that
//! sees the argv, the run config and the box's files, and may add files.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{RunConfig, RunStats, Sandbox, SandboxBackend, SandboxError};

pub type Files = HashMap<String, Vec<u8>>;
type Handler = dyn Fn(&[String], &RunConfig, &mut Files) -> RunStats + Send + Sync;

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

pub struct FakeBackend {
    handler: Arc<Handler>,
    delay: Option<Duration>,
    fail_open: bool,
    counters: Arc<Counters>,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
}

impl FakeBackend {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&[String], &RunConfig, &mut Files) -> RunStats + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            delay: None,
            fail_open: false,
            counters: Arc::default(),
            commands: Arc::default(),
        }
    }

    /// Every command takes at least `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every `open` fails as if the box could not be initialized
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    /// Highest number of commands that were running at the same time
    pub fn max_concurrent(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }

    /// Argv of every command run so far
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn open(&self, box_id: u32) -> Result<Box<dyn Sandbox>, SandboxError> {
        if self.fail_open {
            return Err(SandboxError::Init {
                box_id,
                message: "scripted failure".into(),
            });
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeBox {
            box_id,
            files: Mutex::default(),
            handler: self.handler.clone(),
            delay: self.delay,
            counters: self.counters.clone(),
            commands: self.commands.clone(),
        }))
    }
}

struct FakeBox {
    box_id: u32,
    files: Mutex<Files>,
    handler: Arc<Handler>,
    delay: Option<Duration>,
    counters: Arc<Counters>,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
}

#[async_trait]
impl Sandbox for FakeBox {
    fn box_id(&self) -> u32 {
        self.box_id
    }

    async fn write_file(&self, path: &str, data: &[u8], _mode: u32) -> Result<(), SandboxError> {
        super::relative_box_path(path)?;
        self.files.lock().unwrap().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::FileNotFound(path.to_string()))
    }

    async fn run_command(&self, command: &[String], config: &RunConfig) -> Result<RunStats, SandboxError> {
        if command.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }
        self.commands.lock().unwrap().push(command.to_vec());

        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_active.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let stats = {
            let mut files = self.files.lock().unwrap();
            (self.handler)(command, config, &mut files)
        };
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        Ok(stats)
    }

    async fn close(self: Box<Self>) -> Result<(), SandboxError> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
