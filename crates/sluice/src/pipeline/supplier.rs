use sluice_api::TupleBatch;

/// Supplies the output batch an operator collects into.
///
/// Interior operators reuse one cached buffer, since their output is
/// consumed synchronously by the next operator in the chain. The flow's
/// terminal operator gets whichever supplier the configuration names.
#[derive(Debug)]
pub enum OutputSupplier {
    Cached {
        port_count: usize,
        cached: Option<TupleBatch>,
    },
    Fresh {
        port_count: usize,
    },
}

impl OutputSupplier {
    pub fn cached(port_count: usize) -> Self {
        OutputSupplier::Cached {
            port_count,
            cached: None,
        }
    }

    pub fn fresh(port_count: usize) -> Self {
        OutputSupplier::Fresh { port_count }
    }

    pub fn supply(&mut self) -> TupleBatch {
        match self {
            OutputSupplier::Cached { port_count, cached } => cached
                .take()
                .unwrap_or_else(|| TupleBatch::new(*port_count)),
            OutputSupplier::Fresh { port_count } => TupleBatch::new(*port_count),
        }
    }

    /// Returns an unused batch to the supplier for reuse.
    pub fn recycle(&mut self, mut batch: TupleBatch) {
        if let OutputSupplier::Cached { cached, .. } = self {
            batch.clear();
            *cached = Some(batch);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sluice_api::Tuple;

    #[test]
    fn cached_supplier_reuses_recycled_batches() {
        let mut supplier = OutputSupplier::cached(1);
        let mut batch = supplier.supply();
        batch.add(0, Tuple::of("n", 1i64));
        supplier.recycle(batch);
        let batch = supplier.supply();
        assert!(batch.is_empty());
        assert_eq!(batch.port_count(), 1);
    }
}
