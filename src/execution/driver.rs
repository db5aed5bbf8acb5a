//! The computation thread driving a live pipeline.
//!
//! The driver pulls the pipeline's sinks with increasing timesteps on a
//! dedicated thread. Errors are reported through a channel; recoverable ones
//! do not stop the loop.

use crate::config::DriverConfig;
use crate::core::error::PipelineError;
use crate::execution::context::PipelineContext;
use crate::graph::Stage;
use crossbeam::channel::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

/// Something that happened on the driver thread.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Every sink was updated for `timestep`.
    Updated { timestep: u64 },
    /// A sink failed for `timestep`. Fatal errors end the loop.
    Failed {
        timestep: u64,
        error: PipelineError,
        fatal: bool,
    },
    /// The thread exited after `timesteps` iterations.
    Stopped { timesteps: u64 },
}

/// Handle to a running driver thread.
///
/// Dropping the handle stops the thread and waits for it.
pub struct PipelineDriver {
    handle: Option<JoinHandle<u64>>,
    events: Receiver<DriverEvent>,
    context: PipelineContext,
}

impl PipelineDriver {
    /// Start driving `sinks` from timestep 1.
    pub fn start(
        sinks: Vec<Stage>,
        context: &PipelineContext,
        config: &DriverConfig,
    ) -> std::io::Result<Self> {
        Self::start_at(sinks, context, config, 1)
    }

    /// Start driving `sinks` from `first_timestep`.
    pub fn start_at(
        sinks: Vec<Stage>,
        context: &PipelineContext,
        config: &DriverConfig,
        first_timestep: u64,
    ) -> std::io::Result<Self> {
        let (sender, events) = channel::unbounded();
        context.clear_stop();

        let loop_context = context.clone();
        let config = config.clone();
        let handle = thread::Builder::new()
            .name("heteroflow-driver".to_string())
            .spawn(move || drive(sinks, loop_context, config, first_timestep, sender))?;

        log::info!("Pipeline driver started at timestep {}", first_timestep);
        Ok(Self {
            handle: Some(handle),
            events,
            context: context.clone(),
        })
    }

    /// Events emitted by the driver thread.
    pub fn events(&self) -> &Receiver<DriverEvent> {
        &self.events
    }

    /// Whether the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Request a stop and wait for the thread. Returns the number of
    /// timesteps it ran.
    pub fn stop(mut self) -> u64 {
        self.context.request_stop();
        self.wait()
    }

    /// Wait for the thread to end on its own (timestep limit or fatal error).
    pub fn join(mut self) -> u64 {
        self.wait()
    }

    fn wait(&mut self) -> u64 {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(timesteps)) => timesteps,
            Some(Err(_)) => {
                log::error!("Pipeline driver thread panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for PipelineDriver {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.context.request_stop();
            self.wait();
        }
    }
}

fn drive(
    sinks: Vec<Stage>,
    context: PipelineContext,
    config: DriverConfig,
    first_timestep: u64,
    events: Sender<DriverEvent>,
) -> u64 {
    let mut timestep = first_timestep;
    let mut completed = 0u64;

    'timesteps: while !context.is_stop_requested() {
        if config.max_timesteps.is_some_and(|max| completed >= max) {
            break;
        }

        let mut failed = false;
        for sink in &sinks {
            if let Err(error) = sink.update(timestep, config.streaming_mode) {
                failed = true;
                let fatal = !error.is_recoverable();
                if fatal {
                    log::error!("Timestep {}: {} failed fatally: {}", timestep, sink, error);
                } else {
                    log::warn!("Timestep {}: {} failed: {}", timestep, sink, error);
                }
                let _ = events.send(DriverEvent::Failed {
                    timestep,
                    error,
                    fatal,
                });
                if fatal {
                    completed += 1;
                    break 'timesteps;
                }
            }
        }
        if !failed {
            let _ = events.send(DriverEvent::Updated { timestep });
        }

        completed += 1;
        timestep += 1;
        if config.interval_ms > 0 {
            thread::sleep(config.interval());
        }
    }

    log::info!("Pipeline driver stopped after {} timesteps", completed);
    let _ = events.send(DriverEvent::Stopped {
        timesteps: completed,
    });
    completed
}
