//! Per-object multi-device coherence.
//!
//! Every data object embeds a [`CoherenceStore`]. The store tracks one
//! representation per device (a host buffer or a device surface), which of
//! them are current, and which have open access guards. Representations are
//! brought up to date lazily, when a guard asks for them:
//!
//! 1. A current representation is returned as is.
//! 2. A missing representation is allocated. If the object has no
//!    representation anywhere, the new one is current (zero-filled).
//! 3. Otherwise the first current representation (host first, then devices
//!    in insertion order) is copied in, directly or through the host.
//! 4. With no current representation anywhere the request fails.
//!
//! Surfaces whose channel count a device cannot store are padded to four
//! channels on the way in and stripped on the way out.

use crate::core::error::{AccessError, AccessResult, DataId, DeviceError};
use crate::core::types::{AccessMode, ElementType};
use crate::data::object::next_timestamp;
use crate::device::{DeviceBackend, DeviceId, ExecutionDevice, SurfaceId};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Buffers at least this large are padded or stripped in parallel.
const PARALLEL_THRESHOLD: usize = 1 << 16;

// ============================================================================
// Layout
// ============================================================================

/// Shape class of a data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutKind {
    /// An image-like surface; may be channel-padded on devices.
    Surface { size: [u32; 3], dimensions: u8 },
    /// A flat buffer (meshes, point sets); never padded.
    Buffer,
}

/// Shape and element format of a data object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub element_type: ElementType,
    pub components: u32,
    pub element_count: usize,
    pub kind: LayoutKind,
}

impl Layout {
    /// Layout of a 2D or 3D surface. Unused trailing sizes must be 1.
    pub fn surface(
        size: [u32; 3],
        dimensions: u8,
        element_type: ElementType,
        components: u32,
    ) -> AccessResult<Self> {
        if dimensions != 2 && dimensions != 3 {
            return Err(AccessError::invalid_dimensions(format!(
                "dimensionality must be 2 or 3, got {}",
                dimensions
            )));
        }
        if size.iter().any(|&s| s == 0) {
            return Err(AccessError::invalid_dimensions(format!(
                "size must be non-zero, got {:?}",
                size
            )));
        }
        if dimensions == 2 && size[2] != 1 {
            return Err(AccessError::invalid_dimensions("2D surface must have depth 1"));
        }
        if !(1..=4).contains(&components) {
            return Err(AccessError::invalid_dimensions(format!(
                "component count must be between 1 and 4, got {}",
                components
            )));
        }
        let element_count = size
            .iter()
            .try_fold(1usize, |count, &s| count.checked_mul(s as usize))
            .ok_or_else(|| {
                AccessError::invalid_dimensions(format!("size {:?} overflows the address space", size))
            })?;
        // Room for padding to four channels on any device.
        checked_len(element_count, element_type, components.max(4))?;
        Ok(Self {
            element_type,
            components,
            element_count,
            kind: LayoutKind::Surface { size, dimensions },
        })
    }

    /// Layout of a flat buffer of `element_count` elements.
    pub fn buffer(
        element_type: ElementType,
        components: u32,
        element_count: usize,
    ) -> AccessResult<Self> {
        if components == 0 {
            return Err(AccessError::invalid_dimensions("component count must be non-zero"));
        }
        checked_len(element_count, element_type, components)?;
        Ok(Self {
            element_type,
            components,
            element_count,
            kind: LayoutKind::Buffer,
        })
    }

    /// Bytes per element (all components).
    pub fn element_size(&self) -> usize {
        self.element_type.size_of() * self.components as usize
    }

    /// Bytes of the logical (unpadded) content.
    pub fn byte_len(&self) -> usize {
        self.element_count * self.element_size()
    }

    /// Channel count the representation on `device` stores.
    pub fn stored_components(&self, device: &ExecutionDevice) -> u32 {
        match self.kind {
            LayoutKind::Surface { .. } if !device.capabilities().supports_channels(self.components) => 4,
            _ => self.components,
        }
    }

    fn stored_len(&self, components: u32) -> usize {
        self.element_count * self.element_type.size_of() * components as usize
    }
}

/// Bytes of `element_count` elements of `components` channels, if addressable.
fn checked_len(element_count: usize, element_type: ElementType, components: u32) -> AccessResult<usize> {
    element_count
        .checked_mul(element_type.size_of())
        .and_then(|len| len.checked_mul(components as usize))
        .filter(|len| *len <= isize::MAX as usize)
        .ok_or_else(|| {
            AccessError::invalid_dimensions(format!(
                "{} elements of {} x {} overflow the address space",
                element_count, components, element_type
            ))
        })
}

/// Re-pack interleaved elements from `from` to `to` channels.
///
/// Extra channels are zero; surplus channels are dropped.
pub fn convert_channels(bytes: &[u8], component_size: usize, from: u32, to: u32) -> Vec<u8> {
    if from == to {
        return bytes.to_vec();
    }
    let src_stride = component_size * from as usize;
    let dst_stride = component_size * to as usize;
    let keep = component_size * from.min(to) as usize;
    let elements = if src_stride == 0 { 0 } else { bytes.len() / src_stride };
    let mut out = vec![0u8; elements * dst_stride];

    if out.len() >= PARALLEL_THRESHOLD {
        out.par_chunks_mut(dst_stride)
            .zip(bytes.par_chunks(src_stride))
            .for_each(|(dst, src)| dst[..keep].copy_from_slice(&src[..keep]));
    } else {
        out.chunks_mut(dst_stride)
            .zip(bytes.chunks(src_stride))
            .for_each(|(dst, src)| dst[..keep].copy_from_slice(&src[..keep]));
    }
    out
}

// ============================================================================
// Representations
// ============================================================================

/// Host memory, 8-byte aligned so any element type can be viewed in place.
pub struct HostBuffer {
    words: Vec<u64>,
    len: usize,
}

impl HostBuffer {
    /// A zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(8)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }
}

#[derive(Clone)]
pub(crate) enum Storage {
    Host(Arc<RwLock<HostBuffer>>),
    Device { surface: SurfaceId, components: u32 },
}

struct Representation {
    device: ExecutionDevice,
    storage: Storage,
    current: bool,
    readers: u32,
    writing: bool,
}

impl Representation {
    fn in_use(&self) -> bool {
        self.readers > 0 || self.writing
    }
}

/// Coherence state of one device's representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoherenceState {
    Absent,
    Stale,
    Current,
}

/// Transfer and allocation counters of one store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCounts {
    pub host_to_device: u64,
    pub device_to_host: u64,
    /// Peer moves that bypass the host representation. The bytes are staged
    /// in memory since backends only copy within one device.
    pub device_to_device: u64,
    pub allocations: u64,
    pub frees: u64,
}

impl TransferCounts {
    /// Total number of byte transfers in any direction.
    pub fn transfers(&self) -> u64 {
        self.host_to_device + self.device_to_host + self.device_to_device
    }
}

#[derive(Default)]
struct StoreState {
    layout: Option<Layout>,
    reps: IndexMap<DeviceId, Representation>,
    being_written: bool,
    references: HashMap<DeviceId, u32>,
    counts: TransferCounts,
}

impl StoreState {
    fn any_in_use(&self) -> bool {
        self.being_written || self.reps.values().any(Representation::in_use)
    }

    /// First current representation other than `exclude`, host first.
    fn find_current(&self, exclude: DeviceId) -> Option<DeviceId> {
        if exclude != DeviceId::HOST {
            if let Some(host) = self.reps.get(&DeviceId::HOST) {
                if host.current {
                    return Some(DeviceId::HOST);
                }
            }
        }
        self.reps
            .iter()
            .find(|(id, rep)| **id != exclude && rep.current)
            .map(|(id, _)| *id)
    }
}

struct StoreShared {
    id: DataId,
    created: u64,
    modified: AtomicU64,
    state: Mutex<StoreState>,
}

impl Drop for StoreShared {
    fn drop(&mut self) {
        for (_, rep) in self.state.get_mut().reps.drain(..) {
            let Storage::Device { surface, .. } = rep.storage else {
                continue;
            };
            let Some(backend) = rep.device.backend() else {
                continue;
            };
            if let Err(e) = backend.free(surface) {
                log::warn!(
                    "Failed to free data {} on {}: {}",
                    self.id,
                    rep.device,
                    e
                );
            }
        }
    }
}

fn backend_of(device: &ExecutionDevice) -> AccessResult<&Arc<dyn DeviceBackend>> {
    device
        .backend()
        .ok_or_else(|| DeviceError::NotAvailable(device.name().to_string()).into())
}

fn upload_from_host(
    layout: &Layout,
    buffer: &RwLock<HostBuffer>,
    device: &ExecutionDevice,
    surface: SurfaceId,
    components: u32,
) -> AccessResult<()> {
    let bytes = {
        let host = buffer.read();
        convert_channels(
            host.as_bytes(),
            layout.element_type.size_of(),
            layout.components,
            components,
        )
    };
    backend_of(device)?.upload(surface, bytes)?;
    Ok(())
}

fn download_to_host(
    layout: &Layout,
    device: &ExecutionDevice,
    surface: SurfaceId,
    components: u32,
    buffer: &RwLock<HostBuffer>,
) -> AccessResult<()> {
    let raw = backend_of(device)?.download(surface)?;
    let bytes = if components == layout.components {
        raw
    } else {
        convert_channels(&raw, layout.element_type.size_of(), components, layout.components)
    };
    let mut host = buffer.write();
    if bytes.len() != host.len() {
        return Err(DeviceError::SizeMismatch {
            expected: host.len(),
            got: bytes.len(),
        }
        .into());
    }
    host.as_bytes_mut().copy_from_slice(&bytes);
    Ok(())
}

// ============================================================================
// CoherenceStore
// ============================================================================

/// Coherence bookkeeping for one data object. Cheap to clone.
#[derive(Clone)]
pub struct CoherenceStore {
    shared: Arc<StoreShared>,
}

impl CoherenceStore {
    /// An uninitialized store.
    pub fn new(id: DataId) -> Self {
        let created = next_timestamp();
        Self {
            shared: Arc::new(StoreShared {
                id,
                created,
                modified: AtomicU64::new(created),
                state: Mutex::new(StoreState::default()),
            }),
        }
    }

    pub fn id(&self) -> DataId {
        self.shared.id
    }

    /// Modification timestamp.
    pub fn timestamp(&self) -> u64 {
        self.shared.modified.load(Ordering::Acquire)
    }

    pub fn creation_timestamp(&self) -> u64 {
        self.shared.created
    }

    /// Bump the modification timestamp.
    pub fn touch(&self) {
        self.shared.modified.fetch_max(next_timestamp(), Ordering::AcqRel);
    }

    /// Current layout, `None` before the first initialization.
    pub fn layout(&self) -> Option<Layout> {
        self.shared.state.lock().layout.clone()
    }

    /// Current layout or [`AccessError::NotInitialized`].
    pub fn require_layout(&self) -> AccessResult<Layout> {
        self.layout().ok_or(AccessError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.state.lock().layout.is_some()
    }

    /// (Re)define the layout, dropping every representation.
    ///
    /// With `data`, the given device receives the bytes and becomes the
    /// only current representation.
    pub fn initialize(
        &self,
        layout: Layout,
        data: Option<(&ExecutionDevice, &[u8])>,
    ) -> AccessResult<()> {
        if let Some((_, bytes)) = data {
            if bytes.len() != layout.byte_len() {
                return Err(AccessError::invalid_dimensions(format!(
                    "expected {} bytes of data, got {}",
                    layout.byte_len(),
                    bytes.len()
                )));
            }
        }

        let mut state = self.shared.state.lock();
        if state.any_in_use() {
            return Err(AccessError::ConcurrentAccess);
        }
        let existing: Vec<DeviceId> = state.reps.keys().copied().collect();
        for id in existing {
            self.free_locked(&mut state, id)?;
        }
        state.layout = Some(layout.clone());

        if let Some((device, bytes)) = data {
            let mut rep = self.allocate(&mut state, &layout, device)?;
            match &rep.storage {
                Storage::Host(buffer) => buffer.write().as_bytes_mut().copy_from_slice(bytes),
                Storage::Device {
                    surface,
                    components,
                } => {
                    let padded = convert_channels(
                        bytes,
                        layout.element_type.size_of(),
                        layout.components,
                        *components,
                    );
                    backend_of(device)?.upload(*surface, padded)?;
                }
            }
            rep.current = true;
            state.reps.insert(device.id(), rep);
        }

        log::debug!(
            "Initialized data {} as {} x {} {} elements",
            self.shared.id,
            layout.element_count,
            layout.components,
            layout.element_type
        );
        drop(state);
        self.touch();
        Ok(())
    }

    fn allocate(
        &self,
        state: &mut StoreState,
        layout: &Layout,
        device: &ExecutionDevice,
    ) -> AccessResult<Representation> {
        let storage = match device.backend() {
            None => Storage::Host(Arc::new(RwLock::new(HostBuffer::zeroed(layout.byte_len())))),
            Some(backend) => {
                let components = layout.stored_components(device);
                let surface = backend.allocate(layout.stored_len(components))?;
                Storage::Device {
                    surface,
                    components,
                }
            }
        };
        state.counts.allocations += 1;
        log::debug!("Allocated representation of data {} on {}", self.shared.id, device);
        Ok(Representation {
            device: device.clone(),
            storage,
            current: false,
            readers: 0,
            writing: false,
        })
    }

    fn free_locked(&self, state: &mut StoreState, id: DeviceId) -> AccessResult<()> {
        if let Some(rep) = state.reps.shift_remove(&id) {
            if let Storage::Device { surface, .. } = rep.storage {
                backend_of(&rep.device)?.free(surface)?;
            }
            state.counts.frees += 1;
            log::debug!("Freed representation of data {} on {}", self.shared.id, rep.device);
        }
        Ok(())
    }

    fn ensure_current_locked(
        &self,
        state: &mut StoreState,
        layout: &Layout,
        device: &ExecutionDevice,
    ) -> AccessResult<()> {
        let target = device.id();
        match state.reps.get(&target) {
            Some(rep) if rep.current => {
                log::trace!("Data {} already current on {}", self.shared.id, device);
                return Ok(());
            }
            Some(_) => {}
            None => {
                let bootstrap = state.reps.is_empty();
                let mut rep = self.allocate(state, layout, device)?;
                rep.current = bootstrap;
                state.reps.insert(target, rep);
                if bootstrap {
                    return Ok(());
                }
            }
        }

        let source = state.find_current(target).ok_or(AccessError::NoCurrentData)?;
        self.transfer(state, layout, source, device)?;
        if let Some(rep) = state.reps.get_mut(&target) {
            rep.current = true;
        }
        Ok(())
    }

    fn transfer(
        &self,
        state: &mut StoreState,
        layout: &Layout,
        source: DeviceId,
        target: &ExecutionDevice,
    ) -> AccessResult<()> {
        let (src_device, src_storage) = state
            .reps
            .get(&source)
            .map(|rep| (rep.device.clone(), rep.storage.clone()))
            .ok_or(AccessError::NoCurrentData)?;
        let dst_storage = state
            .reps
            .get(&target.id())
            .map(|rep| rep.storage.clone())
            .ok_or(AccessError::NoCurrentData)?;

        log::trace!(
            "Transferring data {} from {} to {}",
            self.shared.id,
            src_device,
            target
        );

        match (src_storage, dst_storage) {
            (Storage::Host(_), Storage::Host(_)) => {}
            (
                Storage::Host(buffer),
                Storage::Device {
                    surface,
                    components,
                },
            ) => {
                upload_from_host(layout, &buffer, target, surface, components)?;
                state.counts.host_to_device += 1;
            }
            (
                Storage::Device {
                    surface,
                    components,
                },
                Storage::Host(buffer),
            ) => {
                download_to_host(layout, &src_device, surface, components, &buffer)?;
                state.counts.device_to_host += 1;
            }
            (
                Storage::Device {
                    surface: src_surface,
                    components: src_components,
                },
                Storage::Device {
                    surface: dst_surface,
                    components: dst_components,
                },
            ) => {
                if src_device.capabilities().is_peer_of(target.capabilities()) {
                    // Peer path: bytes move between the two backends without
                    // touching the host representation. Backends expose no
                    // cross-device copy, so the move is staged in memory.
                    let raw = backend_of(&src_device)?.download(src_surface)?;
                    let bytes = if src_components == dst_components {
                        raw
                    } else {
                        convert_channels(
                            &raw,
                            layout.element_type.size_of(),
                            src_components,
                            dst_components,
                        )
                    };
                    backend_of(target)?.upload(dst_surface, bytes)?;
                    state.counts.device_to_device += 1;
                } else {
                    // No direct path: stage through the host, which becomes current too.
                    let host = ExecutionDevice::host();
                    if !state.reps.contains_key(&DeviceId::HOST) {
                        let rep = self.allocate(state, layout, &host)?;
                        state.reps.insert(DeviceId::HOST, rep);
                    }
                    let buffer = match state.reps.get(&DeviceId::HOST).map(|r| r.storage.clone()) {
                        Some(Storage::Host(buffer)) => buffer,
                        _ => return Err(AccessError::NoCurrentData),
                    };
                    download_to_host(layout, &src_device, src_surface, src_components, &buffer)?;
                    state.counts.device_to_host += 1;
                    if let Some(rep) = state.reps.get_mut(&DeviceId::HOST) {
                        rep.current = true;
                    }
                    upload_from_host(layout, &buffer, target, dst_surface, dst_components)?;
                    state.counts.host_to_device += 1;
                }
            }
        }
        Ok(())
    }

    /// Make the representation on `device` current without opening a guard.
    ///
    /// Blocks until the device has finished the transfer.
    pub fn ensure_current(&self, device: &ExecutionDevice) -> AccessResult<()> {
        {
            let mut state = self.shared.state.lock();
            let layout = state.layout.clone().ok_or(AccessError::NotInitialized)?;
            if state.being_written {
                return Err(AccessError::AlreadyWriting);
            }
            self.ensure_current_locked(&mut state, &layout, device)?;
        }
        device.finish()?;
        Ok(())
    }

    /// Grant access to the representation on `device`.
    ///
    /// The caller must pair a successful grant with [`CoherenceStore::release`].
    pub(crate) fn grant(
        &self,
        device: &ExecutionDevice,
        mode: AccessMode,
    ) -> AccessResult<(Layout, Storage)> {
        let mut state = self.shared.state.lock();
        let layout = state.layout.clone().ok_or(AccessError::NotInitialized)?;

        match mode {
            AccessMode::ReadWrite if state.any_in_use() => {
                return Err(AccessError::ConcurrentAccess);
            }
            AccessMode::Read if state.being_written => {
                return Err(AccessError::AlreadyWriting);
            }
            _ => {}
        }

        self.ensure_current_locked(&mut state, &layout, device)?;

        let target = device.id();
        let storage = {
            let rep = state.reps.get_mut(&target).ok_or(AccessError::NoCurrentData)?;
            match mode {
                AccessMode::Read => rep.readers += 1,
                AccessMode::ReadWrite => rep.writing = true,
            }
            rep.storage.clone()
        };

        if mode == AccessMode::ReadWrite {
            state.being_written = true;
            for (id, rep) in state.reps.iter_mut() {
                if *id != target {
                    rep.current = false;
                }
            }
            self.touch();
        }

        log::debug!(
            "Granted {:?} access to data {} on {}",
            mode,
            self.shared.id,
            device
        );
        Ok((layout, storage))
    }

    /// Close an access granted by [`CoherenceStore::grant`].
    pub(crate) fn release(&self, device: DeviceId, mode: AccessMode) {
        let mut state = self.shared.state.lock();
        if let Some(rep) = state.reps.get_mut(&device) {
            match mode {
                AccessMode::Read => rep.readers = rep.readers.saturating_sub(1),
                AccessMode::ReadWrite => rep.writing = false,
            }
        }
        if mode == AccessMode::ReadWrite {
            state.being_written = false;
        }
        log::debug!("Released {:?} access to data {} on {}", mode, self.shared.id, device);
    }

    /// Coherence state of the representation on `device`.
    pub fn state_on(&self, device: &ExecutionDevice) -> CoherenceState {
        match self.shared.state.lock().reps.get(&device.id()) {
            None => CoherenceState::Absent,
            Some(rep) if rep.current => CoherenceState::Current,
            Some(_) => CoherenceState::Stale,
        }
    }

    /// Devices holding a current representation, in scan order.
    pub fn current_devices(&self) -> Vec<DeviceId> {
        self.shared
            .state
            .lock()
            .reps
            .iter()
            .filter(|(_, rep)| rep.current)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether a write guard is open.
    pub fn is_being_written(&self) -> bool {
        self.shared.state.lock().being_written
    }

    pub fn transfer_counts(&self) -> TransferCounts {
        self.shared.state.lock().counts
    }

    // ------------------------------------------------------------------------
    // Retention and freeing
    // ------------------------------------------------------------------------

    /// Count a reference on `device`; dropping the handle releases it.
    pub fn retain(&self, device: &ExecutionDevice) -> Retention {
        *self
            .shared
            .state
            .lock()
            .references
            .entry(device.id())
            .or_insert(0) += 1;
        Retention {
            store: self.clone(),
            device: device.clone(),
        }
    }

    pub fn reference_count(&self, device: &ExecutionDevice) -> u32 {
        self.shared
            .state
            .lock()
            .references
            .get(&device.id())
            .copied()
            .unwrap_or(0)
    }

    fn release_reference(&self, device: &ExecutionDevice) -> AccessResult<()> {
        let mut state = self.shared.state.lock();
        let id = device.id();
        let remaining = match state.references.get_mut(&id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return Ok(()),
        };
        if remaining > 0 {
            return Ok(());
        }
        state.references.remove(&id);

        let (in_use, current) = match state.reps.get(&id) {
            Some(rep) => (rep.in_use(), rep.current),
            None => return Ok(()),
        };
        if in_use {
            return Ok(());
        }
        let sole_current = current && state.reps.values().filter(|r| r.current).count() == 1;
        if sole_current {
            if device.is_host() {
                return Ok(());
            }
            let layout = state.layout.clone().ok_or(AccessError::NotInitialized)?;
            self.ensure_current_locked(&mut state, &layout, &ExecutionDevice::host())?;
        }
        self.free_locked(&mut state, id)
    }

    /// Drop the representation on `device`.
    ///
    /// Content held only by that representation is lost.
    pub fn free(&self, device: &ExecutionDevice) -> AccessResult<()> {
        let mut state = self.shared.state.lock();
        if state.reps.get(&device.id()).is_some_and(Representation::in_use) {
            return Err(AccessError::ConcurrentAccess);
        }
        self.free_locked(&mut state, device.id())
    }

    /// Drop every representation.
    pub fn free_all(&self) -> AccessResult<()> {
        let mut state = self.shared.state.lock();
        if state.any_in_use() {
            return Err(AccessError::ConcurrentAccess);
        }
        let existing: Vec<DeviceId> = state.reps.keys().copied().collect();
        for id in existing {
            self.free_locked(&mut state, id)?;
        }
        Ok(())
    }

    /// Replace this store's content with a copy of `source`, made on `device`.
    pub fn copy_from(&self, source: &CoherenceStore, device: &ExecutionDevice) -> AccessResult<()> {
        if Arc::ptr_eq(&self.shared, &source.shared) {
            return Ok(());
        }

        let (layout, src_storage) = source.grant(device, AccessMode::Read)?;
        let result = self.copy_granted(&layout, &src_storage, device);
        source.release(device.id(), AccessMode::Read);
        result
    }

    fn copy_granted(
        &self,
        layout: &Layout,
        src_storage: &Storage,
        device: &ExecutionDevice,
    ) -> AccessResult<()> {
        let mut state = self.shared.state.lock();
        if state.any_in_use() {
            return Err(AccessError::ConcurrentAccess);
        }
        let existing: Vec<DeviceId> = state.reps.keys().copied().collect();
        for id in existing {
            self.free_locked(&mut state, id)?;
        }
        state.layout = Some(layout.clone());

        let mut rep = self.allocate(&mut state, layout, device)?;
        match (src_storage, &rep.storage) {
            (Storage::Host(src), Storage::Host(dst)) => {
                dst.write().as_bytes_mut().copy_from_slice(src.read().as_bytes());
            }
            (Storage::Device { surface: src, .. }, Storage::Device { surface: dst, .. }) => {
                backend_of(device)?.copy(*src, *dst)?;
            }
            _ => return Err(AccessError::NoCurrentData),
        }
        rep.current = true;
        state.reps.insert(device.id(), rep);
        drop(state);
        self.touch();
        device.finish()?;
        Ok(())
    }
}

impl fmt::Debug for CoherenceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoherenceStore")
            .field("id", &self.shared.id)
            .field("timestamp", &self.timestamp())
            .finish()
    }
}

/// A counted reference keeping one device representation alive.
///
/// Dropping the last retention for a device frees its representation,
/// writing it back to the host first when it holds the only current copy.
pub struct Retention {
    store: CoherenceStore,
    device: ExecutionDevice,
}

impl Retention {
    pub fn device(&self) -> &ExecutionDevice {
        &self.device
    }
}

impl fmt::Debug for Retention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retention")
            .field("data", &self.store.id())
            .field("device", &self.device)
            .finish()
    }
}

impl Drop for Retention {
    fn drop(&mut self) {
        if let Err(e) = self.store.release_reference(&self.device) {
            log::warn!(
                "Failed to release data {} on {}: {}",
                self.store.id(),
                self.device,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCapabilities, DeviceKind, SimulatedDevice};

    fn sim(name: &str) -> ExecutionDevice {
        ExecutionDevice::accelerator(Arc::new(SimulatedDevice::new(name)))
    }

    fn rgb_layout() -> Layout {
        Layout::surface([2, 2, 1], 2, ElementType::UInt8, 3).unwrap()
    }

    fn read_host(store: &CoherenceStore) -> Vec<u8> {
        let host = ExecutionDevice::host();
        let (_, storage) = store.grant(&host, AccessMode::Read).unwrap();
        let bytes = match storage {
            Storage::Host(buffer) => buffer.read().as_bytes().to_vec(),
            Storage::Device { .. } => unreachable!(),
        };
        store.release(host.id(), AccessMode::Read);
        bytes
    }

    #[test]
    fn test_layout_validation() {
        assert!(Layout::surface([0, 4, 1], 2, ElementType::UInt8, 1).is_err());
        assert!(Layout::surface([4, 4, 2], 2, ElementType::UInt8, 1).is_err());
        assert!(Layout::surface([4, 4, 1], 2, ElementType::UInt8, 5).is_err());
        assert!(Layout::surface([4, 4, 4], 4, ElementType::UInt8, 1).is_err());
        let layout = Layout::surface([4, 3, 2], 3, ElementType::Float32, 2).unwrap();
        assert_eq!(layout.byte_len(), 4 * 3 * 2 * 4 * 2);
    }

    #[test]
    fn test_convert_channels() {
        let rgb = [1u8, 2, 3, 4, 5, 6];
        let rgba = convert_channels(&rgb, 1, 3, 4);
        assert_eq!(rgba, vec![1, 2, 3, 0, 4, 5, 6, 0]);
        assert_eq!(convert_channels(&rgba, 1, 4, 3), rgb.to_vec());

        let wide: Vec<u8> = (0..12).collect();
        let padded = convert_channels(&wide, 2, 3, 4);
        assert_eq!(&padded[..8], &[0, 1, 2, 3, 4, 5, 0, 0]);
    }

    #[test]
    fn test_bootstrap_is_zeroed_and_current() {
        let store = CoherenceStore::new(DataId::new());
        store.initialize(rgb_layout(), None).unwrap();
        let device = sim("sim");
        store.ensure_current(&device).unwrap();
        assert_eq!(store.state_on(&device), CoherenceState::Current);
        assert_eq!(store.transfer_counts().transfers(), 0);

        assert_eq!(read_host(&store), vec![0; 12]);
        assert_eq!(store.transfer_counts().device_to_host, 1);
    }

    #[test]
    fn test_ensure_current_is_idempotent() {
        let store = CoherenceStore::new(DataId::new());
        let host = ExecutionDevice::host();
        store
            .initialize(rgb_layout(), Some((&host, &[7u8; 12])))
            .unwrap();
        let device = sim("sim");

        store.ensure_current(&device).unwrap();
        store.ensure_current(&device).unwrap();
        assert_eq!(store.transfer_counts().host_to_device, 1);
        assert_eq!(store.transfer_counts().transfers(), 1);
    }

    #[test]
    fn test_three_channel_padding_is_invisible() {
        let store = CoherenceStore::new(DataId::new());
        let host = ExecutionDevice::host();
        let data: Vec<u8> = (1..=12).collect();
        store.initialize(rgb_layout(), Some((&host, &data))).unwrap();

        let device = sim("sim");
        let (_, storage) = store.grant(&device, AccessMode::ReadWrite).unwrap();
        let surface = match storage {
            Storage::Device { surface, components } => {
                assert_eq!(components, 4);
                surface
            }
            Storage::Host(_) => unreachable!(),
        };
        let raw = device.backend().unwrap().download(surface).unwrap();
        assert_eq!(raw.len(), 16);
        assert_eq!(&raw[..4], &[1, 2, 3, 0]);
        store.release(device.id(), AccessMode::ReadWrite);

        assert_eq!(store.state_on(&host), CoherenceState::Stale);
        assert_eq!(read_host(&store), data);
    }

    #[test]
    fn test_three_channel_device_stores_natively() {
        let caps = DeviceCapabilities::new(DeviceKind::Gpu).with_three_channel_surfaces();
        let device = ExecutionDevice::accelerator(Arc::new(SimulatedDevice::with_capabilities(
            "rgb", caps,
        )));
        assert_eq!(rgb_layout().stored_components(&device), 3);
    }

    #[test]
    fn test_device_to_device_through_host() {
        let store = CoherenceStore::new(DataId::new());
        let a = sim("a");
        let b = sim("b");
        store.initialize(rgb_layout(), Some((&a, &[9u8; 12]))).unwrap();

        store.ensure_current(&b).unwrap();
        let counts = store.transfer_counts();
        assert_eq!(counts.device_to_host, 1);
        assert_eq!(counts.host_to_device, 1);
        assert_eq!(counts.device_to_device, 0);
        assert_eq!(store.state_on(&ExecutionDevice::host()), CoherenceState::Current);
    }

    #[test]
    fn test_peer_devices_copy_directly() {
        let caps = DeviceCapabilities::new(DeviceKind::Gpu).with_peer_group(7);
        let a = ExecutionDevice::accelerator(Arc::new(SimulatedDevice::with_capabilities(
            "a",
            caps.clone(),
        )));
        let b = ExecutionDevice::accelerator(Arc::new(SimulatedDevice::with_capabilities("b", caps)));
        let store = CoherenceStore::new(DataId::new());
        store.initialize(rgb_layout(), Some((&a, &[3u8; 12]))).unwrap();

        store.ensure_current(&b).unwrap();
        assert_eq!(store.transfer_counts().device_to_device, 1);
        assert_eq!(store.state_on(&ExecutionDevice::host()), CoherenceState::Absent);
    }

    #[test]
    fn test_no_current_data() {
        let store = CoherenceStore::new(DataId::new());
        let host = ExecutionDevice::host();
        let device = sim("sim");
        store.initialize(rgb_layout(), Some((&host, &[1u8; 12]))).unwrap();
        store.ensure_current(&device).unwrap();
        store.free(&host).unwrap();
        store.free(&device).unwrap();
        // Bootstraps again: nothing is left anywhere.
        store.ensure_current(&device).unwrap();

        let stale = CoherenceStore::new(DataId::new());
        stale.initialize(rgb_layout(), Some((&host, &[1u8; 12]))).unwrap();
        stale.ensure_current(&device).unwrap();
        let (_, _) = stale.grant(&device, AccessMode::ReadWrite).unwrap();
        stale.release(device.id(), AccessMode::ReadWrite);
        stale.free(&device).unwrap();
        assert_eq!(stale.state_on(&host), CoherenceState::Stale);
        assert_eq!(stale.ensure_current(&host), Err(AccessError::NoCurrentData));
    }

    #[test]
    fn test_initialize_rejects_wrong_size() {
        let store = CoherenceStore::new(DataId::new());
        let host = ExecutionDevice::host();
        assert!(matches!(
            store.initialize(rgb_layout(), Some((&host, &[0u8; 5]))),
            Err(AccessError::InvalidDimensions { .. })
        ));
        assert!(!store.is_initialized());
    }

    #[test]
    fn test_retention_writes_back_sole_current_device() {
        let store = CoherenceStore::new(DataId::new());
        let device = sim("sim");
        store.initialize(rgb_layout(), Some((&device, &[5u8; 12]))).unwrap();

        let retention = store.retain(&device);
        let second = store.retain(&device);
        assert_eq!(store.reference_count(&device), 2);
        drop(second);
        assert_eq!(store.state_on(&device), CoherenceState::Current);

        drop(retention);
        assert_eq!(store.reference_count(&device), 0);
        assert_eq!(store.state_on(&device), CoherenceState::Absent);
        assert_eq!(store.state_on(&ExecutionDevice::host()), CoherenceState::Current);
        assert_eq!(read_host(&store), vec![5; 12]);
    }

    #[test]
    fn test_retention_keeps_sole_current_host() {
        let store = CoherenceStore::new(DataId::new());
        let host = ExecutionDevice::host();
        store.initialize(rgb_layout(), Some((&host, &[5u8; 12]))).unwrap();
        drop(store.retain(&host));
        assert_eq!(store.state_on(&host), CoherenceState::Current);
    }

    #[test]
    fn test_copy_from_on_device() {
        let device = sim("sim");
        let source = CoherenceStore::new(DataId::new());
        source
            .initialize(rgb_layout(), Some((&ExecutionDevice::host(), &[4u8; 12])))
            .unwrap();
        let copy = CoherenceStore::new(DataId::new());
        copy.copy_from(&source, &device).unwrap();

        assert_eq!(copy.state_on(&device), CoherenceState::Current);
        assert_eq!(copy.state_on(&ExecutionDevice::host()), CoherenceState::Absent);
        assert_eq!(read_host(&copy), vec![4; 12]);
        assert!(copy.timestamp() > source.timestamp());
    }

    #[test]
    fn test_dropped_store_frees_device_surfaces() {
        let backend = Arc::new(SimulatedDevice::new("sim"));
        let device = ExecutionDevice::accelerator(backend.clone());

        for _ in 0..10 {
            let store = CoherenceStore::new(DataId::new());
            store
                .initialize(rgb_layout(), Some((&device, &[1u8; 12])))
                .unwrap();
            assert_eq!(backend.live_surfaces(), 1);
            drop(store);
            assert_eq!(backend.live_surfaces(), 0);
        }

        // Clones and retentions keep the surfaces until the last one goes.
        let store = CoherenceStore::new(DataId::new());
        store.initialize(rgb_layout(), None).unwrap();
        store.ensure_current(&device).unwrap();
        let retained = store.retain(&ExecutionDevice::host());
        drop(store);
        assert_eq!(backend.live_surfaces(), 1);
        drop(retained);
        assert_eq!(backend.live_surfaces(), 0);
    }

    #[test]
    fn test_layout_rejects_overflow() {
        let huge = 1u32 << 22;
        assert!(matches!(
            Layout::surface([huge, huge, huge], 3, ElementType::Float32, 4),
            Err(AccessError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            Layout::buffer(ElementType::Float32, 3, usize::MAX / 2),
            Err(AccessError::InvalidDimensions { .. })
        ));
        // Padding to four channels must stay addressable too.
        let layout = Layout::surface([1 << 16, 1 << 16, 1], 2, ElementType::UInt8, 3).unwrap();
        assert_eq!(layout.byte_len(), 3 << 32);
    }

    #[test]
    fn test_touch_never_goes_backwards() {
        let store = CoherenceStore::new(DataId::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..500 {
                        store.touch();
                        let now = store.timestamp();
                        assert!(now >= last);
                        last = now;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let before = store.timestamp();
        store.touch();
        assert!(store.timestamp() > before);
    }
}
