//! Memory-mapped device ports.
//!
//! Every port occupies one byte of the device frame: the n-th registered
//! port answers at offset n. A load from that byte calls [`Port::read`], a
//! store calls [`Port::write`].

pub mod console;

pub use console::SerialConsole;

/// A single byte-wide device port.
pub trait Port {
    fn read(&mut self) -> u8;
    fn write(&mut self, value: u8);
}

/// Ordered set of ports, indexed by device-frame offset.
#[derive(Default)]
pub struct PortRegistry {
    ports: Vec<Box<dyn Port>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a port and return its offset within the device frame.
    pub fn register(&mut self, port: Box<dyn Port>) -> usize {
        self.ports.push(port);
        self.ports.len() - 1
    }

    #[inline]
    pub fn get_mut(&mut self, offset: usize) -> Option<&mut (dyn Port + 'static)> {
        self.ports.get_mut(offset).map(|p| p.as_mut())
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Latch(u8);

    impl Port for Latch {
        fn read(&mut self) -> u8 {
            self.0
        }
        fn write(&mut self, value: u8) {
            self.0 = value;
        }
    }

    #[test]
    fn offsets_follow_registration_order() {
        let mut reg = PortRegistry::new();
        assert_eq!(reg.register(Box::new(Latch(1))), 0);
        assert_eq!(reg.register(Box::new(Latch(2))), 1);
        assert_eq!(reg.len(), 2);

        reg.get_mut(1).unwrap().write(9);
        assert_eq!(reg.get_mut(0).unwrap().read(), 1);
        assert_eq!(reg.get_mut(1).unwrap().read(), 9);
        assert!(reg.get_mut(2).is_none());
    }
}
