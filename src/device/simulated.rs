//! In-process accelerator with its own memory space.
//!
//! Surfaces live on a dedicated worker thread and are only reachable through
//! commands sent over a `crossbeam` channel. Commands execute in the order
//! they were issued, which gives the same in-order queue semantics a real
//! device exposes: a write followed by a read observes the write, and a
//! fence returns only once everything before it has run.

use crate::core::error::{DeviceError, DeviceResult};
use crate::device::backend::{DeviceBackend, DeviceCapabilities, DeviceKind, Kernel, SurfaceId};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

enum Command {
    Allocate {
        surface: SurfaceId,
        len: usize,
    },
    Write {
        surface: SurfaceId,
        bytes: Vec<u8>,
    },
    Read {
        surface: SurfaceId,
        reply: Sender<DeviceResult<Vec<u8>>>,
    },
    Copy {
        src: SurfaceId,
        dst: SurfaceId,
    },
    Kernel {
        surface: SurfaceId,
        kernel: Kernel,
    },
    Free {
        surface: SurfaceId,
    },
    Fence {
        reply: Sender<DeviceResult<()>>,
    },
    Shutdown,
}

/// Device memory owned by the worker thread.
struct Memory {
    surfaces: HashMap<SurfaceId, Vec<u8>>,
    /// First failure of an enqueued command, reported by the next fence or read.
    pending: Option<DeviceError>,
}

impl Memory {
    fn fail(&mut self, error: DeviceError) {
        log::warn!("simulated device command failed: {}", error);
        if self.pending.is_none() {
            self.pending = Some(error);
        }
    }

    fn take_pending(&mut self) -> DeviceResult<()> {
        match self.pending.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn run(&mut self, command: Command) -> bool {
        match command {
            Command::Allocate { surface, len } => {
                self.surfaces.insert(surface, vec![0; len]);
            }
            Command::Write { surface, bytes } => match self.surfaces.get_mut(&surface) {
                Some(target) if target.len() == bytes.len() => target.copy_from_slice(&bytes),
                Some(target) => {
                    let expected = target.len();
                    self.fail(DeviceError::SizeMismatch {
                        expected,
                        got: bytes.len(),
                    })
                }
                None => self.fail(DeviceError::SurfaceNotFound(surface)),
            },
            Command::Read { surface, reply } => {
                let result = self.take_pending().and_then(|_| {
                    self.surfaces
                        .get(&surface)
                        .cloned()
                        .ok_or(DeviceError::SurfaceNotFound(surface))
                });
                let _ = reply.send(result);
            }
            Command::Copy { src, dst } => {
                let source = match self.surfaces.get(&src) {
                    Some(source) => source.clone(),
                    None => {
                        self.fail(DeviceError::SurfaceNotFound(src));
                        return true;
                    }
                };
                match self.surfaces.get_mut(&dst) {
                    Some(target) if target.len() == source.len() => target.copy_from_slice(&source),
                    Some(target) => {
                        let expected = target.len();
                        self.fail(DeviceError::SizeMismatch {
                            expected,
                            got: source.len(),
                        })
                    }
                    None => self.fail(DeviceError::SurfaceNotFound(dst)),
                }
            }
            Command::Kernel { surface, kernel } => match self.surfaces.get_mut(&surface) {
                Some(target) => kernel(target.as_mut_slice()),
                None => self.fail(DeviceError::SurfaceNotFound(surface)),
            },
            Command::Free { surface } => {
                if self.surfaces.remove(&surface).is_none() {
                    self.fail(DeviceError::SurfaceNotFound(surface));
                }
            }
            Command::Fence { reply } => {
                let _ = reply.send(self.take_pending());
            }
            Command::Shutdown => return false,
        }
        true
    }
}

fn worker_loop(receiver: Receiver<Command>) {
    let mut memory = Memory {
        surfaces: HashMap::new(),
        pending: None,
    };
    for command in receiver.iter() {
        if !memory.run(command) {
            break;
        }
    }
}

/// An accelerator simulated by a worker thread.
pub struct SimulatedDevice {
    name: String,
    capabilities: DeviceCapabilities,
    sender: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_surface: AtomicU64,
    live: AtomicU64,
}

impl SimulatedDevice {
    /// Create a GPU-kind device supporting 1, 2 and 4 channel surfaces.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capabilities(name, DeviceCapabilities::new(DeviceKind::Gpu))
    }

    /// Create a device with explicit capabilities.
    pub fn with_capabilities(name: impl Into<String>, capabilities: DeviceCapabilities) -> Self {
        let name = name.into();
        let (sender, receiver) = channel::unbounded();
        let worker = std::thread::Builder::new()
            .name(format!("heteroflow-device-{}", name))
            .spawn(move || worker_loop(receiver))
            .map_err(|e| log::error!("failed to spawn simulated device worker: {}", e))
            .ok();
        Self {
            name,
            capabilities,
            sender,
            worker: Mutex::new(worker),
            next_surface: AtomicU64::new(1),
            live: AtomicU64::new(0),
        }
    }

    /// Surfaces allocated and not yet freed.
    pub fn live_surfaces(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    fn send(&self, command: Command) -> DeviceResult<()> {
        self.sender
            .send(command)
            .map_err(|_| DeviceError::QueueDisconnected(self.name.clone()))
    }

    fn round_trip<T>(&self, build: impl FnOnce(Sender<DeviceResult<T>>) -> Command) -> DeviceResult<T> {
        let (reply, response) = channel::bounded(1);
        self.send(build(reply))?;
        response
            .recv()
            .map_err(|_| DeviceError::QueueDisconnected(self.name.clone()))?
    }
}

impl DeviceBackend for SimulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn allocate(&self, len: usize) -> DeviceResult<SurfaceId> {
        let surface = self.next_surface.fetch_add(1, Ordering::Relaxed);
        self.send(Command::Allocate { surface, len })?;
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(surface)
    }

    fn upload(&self, surface: SurfaceId, bytes: Vec<u8>) -> DeviceResult<()> {
        self.send(Command::Write { surface, bytes })
    }

    fn download(&self, surface: SurfaceId) -> DeviceResult<Vec<u8>> {
        self.round_trip(|reply| Command::Read { surface, reply })
    }

    fn copy(&self, src: SurfaceId, dst: SurfaceId) -> DeviceResult<()> {
        self.send(Command::Copy { src, dst })
    }

    fn dispatch(&self, surface: SurfaceId, kernel: Kernel) -> DeviceResult<()> {
        self.send(Command::Kernel { surface, kernel })
    }

    fn free(&self, surface: SurfaceId) -> DeviceResult<()> {
        self.send(Command::Free { surface })?;
        self.live.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    fn finish(&self) -> DeviceResult<()> {
        self.round_trip(|reply| Command::Fence { reply })
    }
}

impl fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_in_order() {
        let device = SimulatedDevice::new("sim");
        let surface = device.allocate(4).unwrap();
        device.upload(surface, vec![1, 2, 3, 4]).unwrap();
        assert_eq!(device.download(surface).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_new_surfaces_are_zeroed() {
        let device = SimulatedDevice::new("sim");
        let surface = device.allocate(3).unwrap();
        assert_eq!(device.download(surface).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn test_kernel_and_copy() {
        let device = SimulatedDevice::new("sim");
        let a = device.allocate(2).unwrap();
        let b = device.allocate(2).unwrap();
        device.upload(a, vec![5, 6]).unwrap();
        device
            .dispatch(a, Box::new(|bytes: &mut [u8]| bytes.iter_mut().for_each(|b| *b *= 2)))
            .unwrap();
        device.copy(a, b).unwrap();
        device.finish().unwrap();
        assert_eq!(device.download(b).unwrap(), vec![10, 12]);
    }

    #[test]
    fn test_failed_command_reported_at_fence() {
        let device = SimulatedDevice::new("sim");
        let surface = device.allocate(2).unwrap();
        device.upload(surface, vec![1, 2, 3]).unwrap();
        assert!(matches!(
            device.finish(),
            Err(DeviceError::SizeMismatch { expected: 2, got: 3 })
        ));
        // Error is reported once.
        assert!(device.finish().is_ok());
    }

    #[test]
    fn test_missing_surface() {
        let device = SimulatedDevice::new("sim");
        assert_eq!(device.download(42), Err(DeviceError::SurfaceNotFound(42)));
    }
}
