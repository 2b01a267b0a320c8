//! Port registry
//!
//! Owns every live port: id allocation, optional name registration, and
//! destruction. Names are process-wide and first-come-first-served.

use alloc::{collections::BTreeMap, string::String, sync::Arc};

use spin::Mutex;

use super::port::{Port, DEFAULT_CAPACITY};
use crate::error::{KernelError, KernelResult};

struct RegistryInner {
    ports: BTreeMap<u32, Arc<Port>>,
    names: BTreeMap<String, u32>,
    next_id: u32,
}

/// The system-wide port table.
static REGISTRY: Mutex<RegistryInner> = Mutex::new(RegistryInner {
    ports: BTreeMap::new(),
    names: BTreeMap::new(),
    next_id: 1,
});

/// Create a new port and return its handle.
pub fn create(capacity: usize) -> Arc<Port> {
    let mut reg = REGISTRY.lock();
    let id = reg.next_id;
    reg.next_id += 1;
    let port = Arc::new(Port::new(
        id,
        if capacity == 0 { DEFAULT_CAPACITY } else { capacity },
    ));
    reg.ports.insert(id, port.clone());
    port
}

/// Look a port up by id.
pub fn get(id: u32) -> KernelResult<Arc<Port>> {
    REGISTRY
        .lock()
        .ports
        .get(&id)
        .cloned()
        .ok_or(KernelError::NotFound)
}

/// Register a name for a port. Names are unique.
pub fn register(id: u32, name: &str) -> KernelResult<()> {
    if name.is_empty() {
        return Err(KernelError::Invalid);
    }
    let mut reg = REGISTRY.lock();
    if !reg.ports.contains_key(&id) {
        return Err(KernelError::NotFound);
    }
    if reg.names.contains_key(name) {
        return Err(KernelError::AlreadyExists);
    }
    reg.names.insert(String::from(name), id);
    Ok(())
}

/// Resolve a registered name to its port.
pub fn lookup(name: &str) -> KernelResult<Arc<Port>> {
    let reg = REGISTRY.lock();
    let id = reg.names.get(name).ok_or(KernelError::NotFound)?;
    reg.ports
        .get(id)
        .cloned()
        .ok_or(KernelError::NotFound)
}

/// Destroy a port: drop it from the table, unregister its names, and
/// wake every blocked task with `PortClosed`.
pub fn destroy(id: u32) -> KernelResult<()> {
    let port = {
        let mut reg = REGISTRY.lock();
        let port = reg.ports.remove(&id).ok_or(KernelError::NotFound)?;
        reg.names.retain(|_, v| *v != id);
        port
    };
    port.close();
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::message::Message;
    use super::super::port::IpcFlags;
    use super::*;

    #[test]
    fn create_register_lookup_destroy() {
        let port = create(8);
        let name = alloc::format!("svc-{}", port.id);
        register(port.id, &name).unwrap();

        let found = lookup(&name).unwrap();
        assert_eq!(found.id, port.id);
        assert!(Arc::ptr_eq(&found, &get(port.id).unwrap()));

        destroy(port.id).unwrap();
        assert_eq!(lookup(&name).unwrap_err(), KernelError::NotFound);
        assert_eq!(get(port.id).unwrap_err(), KernelError::NotFound);

        // Handles held across destruction observe the closure.
        assert_eq!(
            port.recv(IpcFlags::empty()).unwrap_err(),
            KernelError::PortClosed
        );
        assert_eq!(
            port.send(Message::new(0, 0, b"x", 0), IpcFlags::empty())
                .unwrap_err(),
            KernelError::PortClosed
        );
    }

    #[test]
    fn names_are_exclusive() {
        let a = create(4);
        let b = create(4);
        let name = alloc::format!("excl-{}", a.id);
        register(a.id, &name).unwrap();
        assert_eq!(register(b.id, &name).unwrap_err(), KernelError::AlreadyExists);
        destroy(a.id).unwrap();
        destroy(b.id).unwrap();
    }

    #[test]
    fn register_requires_live_port() {
        assert_eq!(register(0xFFFF_FFF0, "ghost").unwrap_err(), KernelError::NotFound);
    }
}
