//! # Shared Memory Registry
//!
//! Maps names to live segments. Statically described segments are added with
//! [`ShmRegistry::register`]; anything else is allocated by the provider named
//! in the first component of the segment name when it is first opened.

use crate::name::split_name;
use crate::provider::ShmProvider;
use crate::segment::{SharedMemory, ShmFlags};
use crate::{ShmError, ShmResult};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::{Mutex, RwLock};

/// Registry of segments and providers
pub struct ShmRegistry {
    /// Live segments in registration order
    segments: Mutex<Vec<Arc<SharedMemory>>>,
    /// Registered providers
    providers: RwLock<Vec<Arc<dyn ShmProvider>>>,
}

impl ShmRegistry {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            segments: Mutex::new(Vec::new()),
            providers: RwLock::new(Vec::new()),
        }
    }

    /// Register a provider
    ///
    /// Provider names must be unique and non-empty.
    pub fn register_provider(&self, provider: Arc<dyn ShmProvider>) -> ShmResult<()> {
        let name = provider.name();
        if name.is_empty() || name.contains('/') {
            return Err(ShmError::InvalidArgument);
        }
        let mut providers = self.providers.write();
        if providers.iter().any(|p| p.name() == name) {
            log::warn!("shm provider {} already registered", name);
            return Err(ShmError::InvalidArgument);
        }
        log::info!("Registered shm provider: {}", name);
        providers.push(provider);
        Ok(())
    }

    /// Remove a provider
    ///
    /// Segments it already allocated keep their reference to it.
    pub fn unregister_provider(&self, name: &str) -> ShmResult<()> {
        let mut providers = self.providers.write();
        let pos = providers
            .iter()
            .position(|p| p.name() == name)
            .ok_or(ShmError::NotFound)?;
        providers.remove(pos);
        Ok(())
    }

    /// Look up a provider by name
    pub fn provider(&self, name: &str) -> Option<Arc<dyn ShmProvider>> {
        self.providers.read().iter().find(|p| p.name() == name).cloned()
    }

    /// Add a statically described segment
    ///
    /// No uniqueness check is made: registering a name twice shadows in
    /// registration order.
    pub fn register(&self, shm: Arc<SharedMemory>) -> ShmResult<()> {
        if shm.name().is_empty() {
            log::error!("refusing to register unnamed shm segment");
            return Err(ShmError::InvalidArgument);
        }
        log::info!("Registered shm: {} ({} bytes)", shm.name(), shm.size());
        self.segments.lock().push(shm);
        Ok(())
    }

    /// Open a segment, allocating it from its provider if needed
    ///
    /// A registered segment matches when its name is equal and its size is
    /// zero or at least `size`; the first match in registration order wins.
    /// Opening does not take a reference.
    pub fn open(&self, name: &str, size: usize, flags: ShmFlags) -> ShmResult<Arc<SharedMemory>> {
        let mut segments = self.segments.lock();

        let mut undersized = false;
        for shm in segments.iter().filter(|s| s.name() == name) {
            if shm.size() == 0 || shm.size() >= size {
                return Ok(shm.clone());
            }
            undersized = true;
        }

        let (provider_name, _) = split_name(name).map_err(|err| {
            log::warn!("shm open: malformed name {:?}", name);
            err
        })?;
        let Some(provider) = self.provider(provider_name) else {
            log::warn!("shm open: no provider {} for {}", provider_name, name);
            return Err(if undersized {
                ShmError::NotFound
            } else {
                ShmError::InvalidArgument
            });
        };

        let allocation = provider.alloc(name, size, flags).map_err(|err| {
            log::error!("shm open: provider {} failed to allocate {}: {}", provider_name, name, err);
            err
        })?;
        let shm = Arc::new(SharedMemory::from_allocation(name, flags, allocation, provider));
        log::info!("Opened shm: {} ({} bytes)", shm.name(), shm.size());
        segments.push(shm.clone());
        Ok(shm)
    }

    /// Close a segment
    ///
    /// Fails with [`ShmError::InUse`] while references remain, leaving the
    /// segment untouched. Closing a segment that is no longer registered
    /// succeeds. Provider-backed segments are freed and unregistered;
    /// statically registered ones stay registered.
    pub fn close(&self, shm: &Arc<SharedMemory>) -> ShmResult<()> {
        let mut segments = self.segments.lock();
        let Some(pos) = segments.iter().position(|s| Arc::ptr_eq(s, shm)) else {
            return Ok(());
        };

        shm.with_refs_idle(|| {
            if let Some(provider) = shm.provider() {
                provider.free(shm);
                segments.remove(pos);
                log::info!("Closed shm: {}", shm.name());
            }
        })
        .map_err(|err| {
            log::warn!("shm close: {} still has {} references", shm.name(), shm.refcount());
            err
        })
    }

    /// First registered segment with this exact name
    pub fn find(&self, name: &str) -> Option<Arc<SharedMemory>> {
        self.segments.lock().iter().find(|s| s.name() == name).cloned()
    }

    /// Whether `shm` is currently registered
    pub fn contains(&self, shm: &Arc<SharedMemory>) -> bool {
        self.segments.lock().iter().any(|s| Arc::ptr_eq(s, shm))
    }

    /// Number of registered segments
    pub fn len(&self) -> usize {
        self.segments.lock().len()
    }

    /// No segments registered
    pub fn is_empty(&self) -> bool {
        self.segments.lock().is_empty()
    }

    /// Snapshot of the registered segments
    pub fn segments(&self) -> Vec<Arc<SharedMemory>> {
        self.segments.lock().clone()
    }
}

impl Default for ShmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmRegistry")
            .field("segments", &self.len())
            .field("providers", &self.providers.read().len())
            .finish()
    }
}

/// Process-wide registry
static REGISTRY: ShmRegistry = ShmRegistry::new();

/// Get the process-wide registry
pub fn registry() -> &'static ShmRegistry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CarveoutProvider, ShmAllocation};
    use crate::testing::region;
    use amp_hal::{DmaDirection, ScatterList};
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        name: &'static str,
        allocs: AtomicUsize,
        frees: AtomicUsize,
        fail: bool,
    }

    impl CountingProvider {
        fn new(name: &'static str) -> Self {
            Self { name, allocs: AtomicUsize::new(0), frees: AtomicUsize::new(0), fail: false }
        }
    }

    impl ShmProvider for CountingProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn alloc(&self, _name: &str, size: usize, _flags: ShmFlags) -> ShmResult<ShmAllocation> {
            if self.fail {
                return Err(ShmError::OutOfMemory);
            }
            self.allocs.fetch_add(1, Ordering::SeqCst);
            Ok(ShmAllocation::new(size, ScatterList::whole(region(size))))
        }

        fn free(&self, _shm: &SharedMemory) {
            self.frees.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn static_segment(name: &str, size: usize) -> Arc<SharedMemory> {
        Arc::new(SharedMemory::new(name, size, ScatterList::whole(region(size.max(1)))))
    }

    #[test]
    fn test_static_segment_larger_than_request() {
        let reg = ShmRegistry::new();
        let shm = static_segment("ddr/shared0", 4096);
        reg.register(shm.clone()).unwrap();

        let opened = reg.open("ddr/shared0", 2048, ShmFlags::empty()).unwrap();
        assert!(Arc::ptr_eq(&opened, &shm));
        assert_eq!(opened.size(), 4096);
        assert_eq!(opened.refcount(), 0);
    }

    #[test]
    fn test_undersized_static_without_provider() {
        let reg = ShmRegistry::new();
        reg.register(static_segment("ddr/shared0", 4096)).unwrap();
        assert_eq!(
            reg.open("ddr/shared0", 8192, ShmFlags::empty()).unwrap_err(),
            ShmError::NotFound
        );
    }

    #[test]
    fn test_undersized_static_with_provider() {
        let reg = ShmRegistry::new();
        let provider = Arc::new(CountingProvider::new("ddr"));
        reg.register_provider(provider.clone()).unwrap();
        let small = static_segment("ddr/shared0", 4096);
        reg.register(small.clone()).unwrap();

        let big = reg.open("ddr/shared0", 8192, ShmFlags::empty()).unwrap();
        assert!(!Arc::ptr_eq(&big, &small));
        assert_eq!(big.size(), 8192);
        assert_eq!(provider.allocs.load(Ordering::SeqCst), 1);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_missing_provider_is_invalid() {
        let reg = ShmRegistry::new();
        let err = reg.open("bogus/thing", 100, ShmFlags::empty()).unwrap_err();
        assert_eq!(err, ShmError::InvalidArgument);
        assert_eq!(err.errno(), -22);
    }

    #[test]
    fn test_malformed_name() {
        let reg = ShmRegistry::new();
        reg.register_provider(Arc::new(CountingProvider::new("ddr"))).unwrap();
        for bad in ["ddr", "ddr/", "/x", ""] {
            assert_eq!(reg.open(bad, 16, ShmFlags::empty()).unwrap_err(), ShmError::InvalidArgument);
        }
    }

    #[test]
    fn test_zero_size_wildcard() {
        let reg = ShmRegistry::new();
        let shm = static_segment("ocm/any", 0);
        reg.register(shm.clone()).unwrap();
        let opened = reg.open("ocm/any", 1 << 20, ShmFlags::empty()).unwrap();
        assert!(Arc::ptr_eq(&opened, &shm));
    }

    #[test]
    fn test_open_hit_does_not_allocate() {
        let reg = ShmRegistry::new();
        let provider = Arc::new(CountingProvider::new("prov"));
        reg.register_provider(provider.clone()).unwrap();

        let first = reg.open("prov/foo", 256, ShmFlags::empty()).unwrap();
        let second = reg.open("prov/foo", 128, ShmFlags::empty()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.allocs.load(Ordering::SeqCst), 1);

        reg.register(static_segment("prov/bar", 64)).unwrap();
        reg.open("prov/bar", 64, ShmFlags::empty()).unwrap();
        assert_eq!(provider.allocs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_provider_failure_propagates() {
        let reg = ShmRegistry::new();
        let mut provider = CountingProvider::new("ddr");
        provider.fail = true;
        reg.register_provider(Arc::new(provider)).unwrap();
        assert_eq!(
            reg.open("ddr/x", 64, ShmFlags::empty()).unwrap_err(),
            ShmError::OutOfMemory
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let reg = ShmRegistry::new();
        reg.register_provider(Arc::new(CountingProvider::new("ddr"))).unwrap();
        assert_eq!(
            reg.register_provider(Arc::new(CountingProvider::new("ddr"))).unwrap_err(),
            ShmError::InvalidArgument
        );
        reg.unregister_provider("ddr").unwrap();
        assert!(reg.provider("ddr").is_none());
        assert_eq!(reg.unregister_provider("ddr").unwrap_err(), ShmError::NotFound);
    }

    #[test]
    fn test_register_requires_name() {
        let reg = ShmRegistry::new();
        assert_eq!(reg.register(static_segment("", 64)).unwrap_err(), ShmError::InvalidArgument);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_duplicate_register_shadows() {
        let reg = ShmRegistry::new();
        let first = static_segment("ddr/dup", 64);
        let second = static_segment("ddr/dup", 64);
        reg.register(first.clone()).unwrap();
        reg.register(second).unwrap();
        assert_eq!(reg.len(), 2);
        assert!(Arc::ptr_eq(&reg.open("ddr/dup", 64, ShmFlags::empty()).unwrap(), &first));
    }

    #[test]
    fn test_close_gated_by_refcount() {
        let reg = ShmRegistry::new();
        let provider = Arc::new(CountingProvider::new("ddr"));
        reg.register_provider(provider.clone()).unwrap();
        let shm = reg.open("ddr/buf", 1024, ShmFlags::empty()).unwrap();

        let map = shm.mmap(1024).unwrap();
        let dev = crate::Device::new("r5_0");
        shm.attach(&dev, DmaDirection::ToDevice).unwrap();

        assert_eq!(reg.close(&shm).unwrap_err(), ShmError::InUse);
        assert!(reg.contains(&shm));
        assert_eq!(shm.refcount(), 2);
        assert_eq!(shm.references().len(), 2);
        assert_eq!(provider.frees.load(Ordering::SeqCst), 0);

        shm.munmap(map.handle);
        assert_eq!(reg.close(&shm).unwrap_err(), ShmError::InUse);
        shm.detach(&dev);

        reg.close(&shm).unwrap();
        assert!(!reg.contains(&shm));
        assert_eq!(provider.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let reg = ShmRegistry::new();
        let provider = Arc::new(CountingProvider::new("ddr"));
        reg.register_provider(provider.clone()).unwrap();
        let shm = reg.open("ddr/once", 64, ShmFlags::empty()).unwrap();

        reg.close(&shm).unwrap();
        reg.close(&shm).unwrap();
        assert_eq!(provider.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_static_keeps_registration() {
        let reg = ShmRegistry::new();
        let shm = static_segment("ddr/static", 64);
        reg.register(shm.clone()).unwrap();
        reg.close(&shm).unwrap();
        assert!(reg.contains(&shm));
        assert!(Arc::ptr_eq(&reg.find("ddr/static").unwrap(), &shm));
    }

    #[test]
    fn test_reopen_after_close_allocates_again() {
        let reg = ShmRegistry::new();
        let carveout = Arc::new(CarveoutProvider::new("ddr", region(0x2000), 0x1000).unwrap());
        reg.register_provider(carveout.clone()).unwrap();

        let shm = reg.open("ddr/a", 0x2000, ShmFlags::empty()).unwrap();
        assert_eq!(carveout.available(), 0);
        assert_eq!(reg.open("ddr/b", 1, ShmFlags::empty()).unwrap_err(), ShmError::OutOfMemory);

        reg.close(&shm).unwrap();
        assert_eq!(carveout.available(), 0x2000);
        let again = reg.open("ddr/a", 0x1000, ShmFlags::empty()).unwrap();
        assert!(!Arc::ptr_eq(&again, &shm));
    }

    #[test]
    fn test_concurrent_open_allocates_once() {
        let reg = Arc::new(ShmRegistry::new());
        let provider = Arc::new(CountingProvider::new("ddr"));
        reg.register_provider(provider.clone()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.open("ddr/race", 512, ShmFlags::empty()).unwrap())
            })
            .collect();
        let opened: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(provider.allocs.load(Ordering::SeqCst), 1);
        assert!(opened.iter().all(|s| Arc::ptr_eq(s, &opened[0])));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_global_registry() {
        let shm = static_segment("global/seg", 32);
        registry().register(shm.clone()).unwrap();
        assert!(Arc::ptr_eq(&registry().find("global/seg").unwrap(), &shm));
    }
}
