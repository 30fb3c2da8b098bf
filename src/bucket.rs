//! One wheel slot: a FIFO of [`Timeout`] records sharing a tick position
//! modulo the wheel length.

use crate::error::{Error, ErrorKind};
use crate::record::Timeout;

use std::sync::{Arc, Weak};

/// A doubly-linked list of [`Timeout`] records. Only ever touched by the
/// worker thread, so no internal synchronisation is needed.
#[derive(Default)]
pub(crate) struct Bucket {
    head: Option<Arc<Timeout>>,
    tail: Option<Weak<Timeout>>,
}

impl Bucket {
    pub(crate) fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    /// Appends `record` at the tail of this bucket.
    pub(crate) fn add(&mut self, index: usize, record: Arc<Timeout>) {
        debug_assert!(
            record.bucket_index().is_none(),
            "record already linked in a bucket"
        );

        match self.tail.take().and_then(|weak| weak.upgrade()) {
            Some(old_tail) => {
                old_tail.set_next(Some(record.clone()));
                record.set_prev(Some(Arc::downgrade(&old_tail)));
            }
            None => {
                self.head = Some(record.clone());
            }
        }

        self.tail = Some(Arc::downgrade(&record));
        record.set_bucket_index(Some(index));
    }

    /// Unlinks `record` from this bucket, patching its neighbours, and
    /// returns what was its successor (if any). No-ops if the record isn't
    /// currently linked here.
    pub(crate) fn remove(&mut self, record: &Arc<Timeout>) -> Option<Arc<Timeout>> {
        if record.bucket_index().is_none() {
            return None;
        }

        let next = record.take_next();
        let prev = record.take_prev().and_then(|weak| weak.upgrade());

        match &prev {
            Some(p) => p.set_next(next.clone()),
            None => self.head = next.clone(),
        }

        match &next {
            Some(n) => n.set_prev(prev.as_ref().map(Arc::downgrade)),
            None => self.tail = prev.as_ref().map(|p| Arc::downgrade(p)),
        }

        record.set_bucket_index(None);
        record.decrement_pending();

        next
    }

    /// Walks the list from the head, firing records whose round counter has
    /// reached zero, discarding cancelled records, and decrementing the
    /// round counter of everything else. Returns the fired records.
    ///
    /// Fails with [`ErrorKind::InternalConsistency`] if a record whose
    /// round counter reached zero has a deadline past `deadline` — this
    /// indicates the record was hashed into the wrong slot.
    ///
    /// [`ErrorKind::InternalConsistency`]: ../error/enum.ErrorKind.html#variant.InternalConsistency
    pub(crate) fn expire(&mut self, deadline: u64) -> Result<Vec<Arc<Timeout>>, Error<()>> {
        let mut fired = Vec::new();
        let mut cursor = self.head.clone();

        while let Some(node) = cursor {
            cursor = node.next();

            if node.remaining_rounds() <= 0 {
                self.remove(&node);
                if node.deadline() <= deadline {
                    fired.push(node);
                } else {
                    return Err(Error::new(ErrorKind::InternalConsistency {
                        msg: "record's deadline exceeds the bucket's expiry deadline",
                    }));
                }
            } else if node.is_cancelled() {
                self.remove(&node);
            } else {
                node.decrement_remaining_rounds();
            }
        }

        Ok(fired)
    }

    /// Drains every non-expired, non-cancelled record from this bucket into
    /// `out`. Used on shutdown to collect unprocessed timeouts.
    pub(crate) fn clear(&mut self, out: &mut Vec<Arc<Timeout>>) {
        while let Some(node) = self.head.clone() {
            self.remove(&node);
            if node.is_init() {
                out.push(node);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head.clone();
        while let Some(node) = cursor {
            count += 1;
            cursor = node.next();
        }
        count
    }
}
