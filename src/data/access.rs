//! Access guards.
//!
//! A guard is the only way to reach the bytes of a data object. Opening one
//! makes the requested representation current and marks it in use; dropping
//! it clears the in-use marks on every exit path, unwinding included.

use crate::core::error::{AccessError, AccessResult};
use crate::core::types::{AccessMode, Element, ElementSlice, IntensityStats};
use crate::data::coherence::{convert_channels, CoherenceStore, HostBuffer, Layout, Storage};
use crate::device::{DeviceId, ExecutionDevice, Kernel, SurfaceId};
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::sync::Arc;

/// Releases one grant on drop.
struct AccessToken {
    store: CoherenceStore,
    device: DeviceId,
    mode: AccessMode,
}

impl Drop for AccessToken {
    fn drop(&mut self) {
        self.store.release(self.device, self.mode);
    }
}

// ============================================================================
// Host access
// ============================================================================

/// Scoped access to the host representation.
pub struct HostAccess {
    _token: AccessToken,
    buffer: Arc<RwLock<HostBuffer>>,
    layout: Layout,
    mode: AccessMode,
}

impl HostAccess {
    /// Open a guard on the host representation of `store`.
    pub fn acquire(store: &CoherenceStore, mode: AccessMode) -> AccessResult<Self> {
        let host = ExecutionDevice::host();
        let (layout, storage) = store.grant(&host, mode)?;
        let token = AccessToken {
            store: store.clone(),
            device: host.id(),
            mode,
        };
        match storage {
            Storage::Host(buffer) => Ok(Self {
                _token: token,
                buffer,
                layout,
                mode,
            }),
            Storage::Device { .. } => Err(AccessError::NoCurrentData),
        }
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Raw bytes, row-major and component-interleaved.
    pub fn as_bytes(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.buffer.read(), HostBuffer::as_bytes)
    }

    /// Mutable raw bytes. Requires a READ_WRITE guard.
    pub fn as_bytes_mut(&self) -> AccessResult<MappedRwLockWriteGuard<'_, [u8]>> {
        self.require_write()?;
        Ok(RwLockWriteGuard::map(self.buffer.write(), HostBuffer::as_bytes_mut))
    }

    /// Typed view. `T` must match the stored element type.
    pub fn as_slice<T: Element>(&self) -> AccessResult<MappedRwLockReadGuard<'_, [T]>> {
        self.require_type::<T>()?;
        Ok(RwLockReadGuard::map(self.buffer.read(), |b| {
            bytemuck::cast_slice(b.as_bytes())
        }))
    }

    /// Mutable typed view. Requires a READ_WRITE guard.
    pub fn as_mut_slice<T: Element>(&self) -> AccessResult<MappedRwLockWriteGuard<'_, [T]>> {
        self.require_write()?;
        self.require_type::<T>()?;
        Ok(RwLockWriteGuard::map(self.buffer.write(), |b| {
            bytemuck::cast_slice_mut(b.as_bytes_mut())
        }))
    }

    /// Minimum, maximum and mean over every component.
    pub fn statistics(&self) -> Option<IntensityStats> {
        let bytes = self.as_bytes();
        let stats = ElementSlice::from_bytes(self.layout.element_type, &bytes)?.statistics();
        stats
    }

    fn require_write(&self) -> AccessResult<()> {
        match self.mode {
            AccessMode::ReadWrite => Ok(()),
            AccessMode::Read => Err(AccessError::ReadOnlyAccess),
        }
    }

    fn require_type<T: Element>(&self) -> AccessResult<()> {
        if T::TYPE == self.layout.element_type {
            Ok(())
        } else {
            Err(AccessError::ElementTypeMismatch {
                stored: self.layout.element_type,
                requested: T::TYPE,
            })
        }
    }
}

// ============================================================================
// Device access
// ============================================================================

/// Scoped access to a device-resident surface.
pub struct DeviceAccess {
    _token: AccessToken,
    device: ExecutionDevice,
    surface: SurfaceId,
    components: u32,
    layout: Layout,
    mode: AccessMode,
}

impl DeviceAccess {
    /// Open a guard on the representation of `store` on `device`.
    ///
    /// Blocks until every transfer the guard triggered has completed.
    pub fn acquire(
        store: &CoherenceStore,
        device: &ExecutionDevice,
        mode: AccessMode,
    ) -> AccessResult<Self> {
        if device.is_host() {
            return Err(crate::core::error::DeviceError::NotAvailable(
                "the host has no device surfaces".to_string(),
            )
            .into());
        }
        let (layout, storage) = store.grant(device, mode)?;
        let token = AccessToken {
            store: store.clone(),
            device: device.id(),
            mode,
        };
        let (surface, components) = match storage {
            Storage::Device {
                surface,
                components,
            } => (surface, components),
            Storage::Host(_) => return Err(AccessError::NoCurrentData),
        };
        device.finish()?;
        Ok(Self {
            _token: token,
            device: device.clone(),
            surface,
            components,
            layout,
            mode,
        })
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn device(&self) -> &ExecutionDevice {
        &self.device
    }

    /// Native surface handle, valid until the guard drops.
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    /// Channels per element as stored on the device (4 when padded).
    pub fn stored_components(&self) -> u32 {
        self.components
    }

    /// Read the surface back in its logical (unpadded) layout.
    pub fn download(&self) -> AccessResult<Vec<u8>> {
        let raw = self.backend()?.download(self.surface)?;
        Ok(convert_channels(
            &raw,
            self.layout.element_type.size_of(),
            self.components,
            self.layout.components,
        ))
    }

    /// Enqueue a kernel over the stored surface bytes. Requires READ_WRITE.
    pub fn dispatch(&self, kernel: Kernel) -> AccessResult<()> {
        if self.mode != AccessMode::ReadWrite {
            return Err(AccessError::ReadOnlyAccess);
        }
        self.backend()?.dispatch(self.surface, kernel)?;
        Ok(())
    }

    /// Block until queued work on the device has completed.
    pub fn finish(&self) -> AccessResult<()> {
        self.device.finish()?;
        Ok(())
    }

    fn backend(&self) -> AccessResult<&Arc<dyn crate::device::DeviceBackend>> {
        self.device.backend().ok_or_else(|| {
            crate::core::error::DeviceError::NotAvailable(self.device.name().to_string()).into()
        })
    }
}
