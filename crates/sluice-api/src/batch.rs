use crate::Tuple;

/// A multi-port batch of tuples: the unit of data moved between operators.
///
/// Port indices are dense and fixed at construction time. Batches are
/// recycled by the engine's output suppliers, so [`TupleBatch::clear`] keeps
/// the per-port allocations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TupleBatch {
    ports: Vec<Vec<Tuple>>,
}

impl TupleBatch {
    pub fn new(port_count: usize) -> Self {
        Self {
            ports: (0..port_count).map(|_| Vec::new()).collect(),
        }
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn add(&mut self, port: usize, tuple: Tuple) {
        self.ports[port].push(tuple);
    }

    pub fn add_all(&mut self, port: usize, tuples: impl IntoIterator<Item = Tuple>) {
        self.ports[port].extend(tuples);
    }

    pub fn tuples(&self, port: usize) -> &[Tuple] {
        &self.ports[port]
    }

    pub fn tuples_mut(&mut self, port: usize) -> &mut Vec<Tuple> {
        &mut self.ports[port]
    }

    /// Moves the tuples of `port` out of the batch, leaving it empty.
    pub fn take(&mut self, port: usize) -> Vec<Tuple> {
        std::mem::take(&mut self.ports[port])
    }

    pub fn tuple_count(&self, port: usize) -> usize {
        self.ports[port].len()
    }

    pub fn total_tuple_count(&self) -> usize {
        self.ports.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.iter().all(Vec::is_empty)
    }

    pub fn is_non_empty(&self) -> bool {
        !self.is_empty()
    }

    pub fn clear(&mut self) {
        for port in &mut self.ports {
            port.clear();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn take_leaves_port_empty() {
        let mut batch = TupleBatch::new(2);
        batch.add(0, Tuple::of("k", 1i64));
        batch.add(1, Tuple::of("k", 2i64));
        let taken = batch.take(0);
        assert_eq!(taken.len(), 1);
        assert_eq!(batch.tuple_count(0), 0);
        assert_eq!(batch.tuple_count(1), 1);
    }

    #[test]
    fn clear_keeps_port_count() {
        let mut batch = TupleBatch::new(3);
        batch.add(2, Tuple::of("k", 1i64));
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.port_count(), 3);
    }
}
