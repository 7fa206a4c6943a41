//! Paged iteration over a key range.

use crate::error::Result;
use crate::ipc::Guest;
use crate::store::{Blob, Entry, KeyRange, Operation, Reply};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::Arc;

/// Walks a [`KeyRange`] a page at a time.
///
/// Each page is one `iterate` call resuming after the last key seen, so
/// the iterator holds no snapshot and observes writes made between pages.
/// The first page is requested when the iterator is created.
pub struct RaveIterator {
    guest: Arc<Guest>,
    range: KeyRange,
    batch_size: usize,
    remaining: Option<usize>,
    cursor: Option<Blob>,
    buffer: VecDeque<Entry>,
    in_flight: Option<(usize, BoxFuture<'static, Result<Reply>>)>,
    exhausted: bool,
}

impl RaveIterator {
    pub(crate) fn new(guest: Arc<Guest>, range: KeyRange, batch_size: usize) -> Self {
        let remaining = range.limit;
        let mut iter = Self {
            guest,
            range,
            batch_size,
            remaining,
            cursor: None,
            buffer: VecDeque::new(),
            in_flight: None,
            exhausted: remaining == Some(0),
        };
        iter.request_page();
        iter
    }

    fn request_page(&mut self) {
        if self.exhausted || self.in_flight.is_some() {
            return;
        }
        let page = match self.remaining {
            Some(remaining) => remaining.min(self.batch_size),
            None => self.batch_size,
        };

        let mut range = self.range.clone().limit(page);
        if let Some(cursor) = self.cursor.clone() {
            range = if range.reverse {
                range.lt(cursor)
            } else {
                range.gt(cursor)
            };
        }
        self.in_flight = Some((page, self.guest.call(Operation::Iterate { range })));
    }

    /// Next entry as `(key, value)`, or `None` at the end of the range.
    pub async fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Ok(Some((entry.key.into_vec(), entry.value.into_vec())));
            }
            if self.exhausted && self.in_flight.is_none() {
                return Ok(None);
            }

            self.request_page();
            let Some((page, call)) = self.in_flight.take() else {
                return Ok(None);
            };
            let entries = call.await?.into_entries()?;

            if entries.len() < page {
                self.exhausted = true;
            }
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining = remaining.saturating_sub(entries.len());
                if *remaining == 0 {
                    self.exhausted = true;
                }
            }
            if let Some(last) = entries.last() {
                self.cursor = Some(last.key.clone());
            }
            self.buffer.extend(entries);
        }
    }

    /// Collect every remaining entry.
    pub async fn all(mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await? {
            out.push(entry);
        }
        Ok(out)
    }
}
