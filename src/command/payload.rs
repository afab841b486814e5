use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use derive_where::derive_where;
use serde::Serialize;
use typed_builder::TypedBuilder;

use super::validator::{validate_document, ElementNameValidator, NoOpElementNameValidator};
use crate::{
    bson::{self, RawDocumentBuf},
    bson_util,
    error::{Error, Result},
};

/// A window over a shared list of items that are sent to the server in one or more batches.
#[derive_where(Clone)]
#[derive_where(Debug; T: std::fmt::Debug)]
pub struct BatchableSource<T> {
    items: Arc<[T]>,
    offset: usize,
    count: usize,
    can_be_split: bool,
}

impl<T> BatchableSource<T> {
    /// A source over all of `items` that may be split across several batches.
    pub fn new(items: impl Into<Arc<[T]>>) -> Self {
        let items = items.into();
        let count = items.len();
        Self {
            items,
            offset: 0,
            count,
            can_be_split: true,
        }
    }

    /// A source over all of `items` that must be sent in a single batch.
    pub fn fixed(items: impl Into<Arc<[T]>>) -> Self {
        Self {
            can_be_split: false,
            ..Self::new(items)
        }
    }

    /// A source over `count` items starting at `offset`.
    pub fn window(
        items: impl Into<Arc<[T]>>,
        offset: usize,
        count: usize,
        can_be_split: bool,
    ) -> Result<Self> {
        let items = items.into();
        if offset.checked_add(count).map_or(true, |end| end > items.len()) {
            return Err(Error::invalid_argument(format!(
                "a window of {} items at offset {} does not fit in {} items",
                count,
                offset,
                items.len()
            )));
        }
        Ok(Self {
            items,
            offset,
            count,
            can_be_split,
        })
    }

    /// The items in the window.
    pub fn items(&self) -> &[T] {
        &self.items[self.offset..self.offset + self.count]
    }

    /// The position of the window in the shared items.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The number of items in the window.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether there are no items left to send.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether the window may be sent across several batches.
    pub fn can_be_split(&self) -> bool {
        self.can_be_split
    }

    /// The window that remains after the first `processed` items were sent.
    pub fn advanced_past(&self, processed: usize) -> Self {
        let processed = processed.min(self.count);
        Self {
            items: self.items.clone(),
            offset: self.offset + processed,
            count: self.count - processed,
            can_be_split: self.can_be_split,
        }
    }
}

/// How a payload's documents are laid out in the outgoing message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum PayloadFraming {
    /// An OP_MSG type 1 section. Each document costs its own length.
    DocumentSequence,
    /// An array field inside the command document, as sent to servers without OP_MSG. Each
    /// document also pays for its element header.
    EmbeddedArray,
}

impl PayloadFraming {
    fn entry_size(self, index: usize, document_len: usize) -> usize {
        match self {
            Self::DocumentSequence => document_len,
            Self::EmbeddedArray => bson_util::array_entry_size_bytes(index, document_len),
        }
    }
}

/// The limits a batch must respect, derived from the connection and the message being built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct BatchLimits {
    /// The maximum number of items in a batch.
    pub max_batch_count: usize,
    /// The maximum encoded size of a single item.
    pub max_item_size: usize,
    /// The number of bytes available to the batch as a whole.
    pub max_batch_size: usize,
    /// How the batch will be framed.
    pub framing: PayloadFraming,
}

impl BatchLimits {
    /// Creates limits for a batch.
    pub fn new(
        max_batch_count: usize,
        max_item_size: usize,
        max_batch_size: usize,
        framing: PayloadFraming,
    ) -> Self {
        Self {
            max_batch_count,
            max_item_size,
            max_batch_size,
            framing,
        }
    }
}

/// One encoded batch of a payload.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct PayloadBatch {
    /// The encoded items, in source order.
    pub documents: Vec<RawDocumentBuf>,
    /// The bytes the items take up under the batch's framing.
    pub size_bytes: usize,
}

/// A named list of documents sent alongside a command, e.g. the `documents` of an `insert`.
pub trait CommandPayload: Send + Sync {
    /// The field the documents are exposed under in the command.
    fn identifier(&self) -> &str;

    /// Encodes the next batch. The number of items it contains is recorded and available from
    /// [`CommandPayload::processed_count`] afterwards.
    fn encode_batch(&self, limits: &BatchLimits) -> Result<PayloadBatch>;

    /// The number of items included in the most recently encoded batch.
    fn processed_count(&self) -> usize;
}

/// A [`CommandPayload`] over serializable items.
///
/// Sources that can be split are sent in as many items as fit in the limits of the connection
/// (and the overrides set here). Fixed sources are always sent whole. After a command has run,
/// [`PayloadSection::remaining`] gives the source for the next batch.
#[derive(TypedBuilder)]
#[derive_where(Debug; T: std::fmt::Debug)]
pub struct PayloadSection<T> {
    #[builder(setter(into))]
    identifier: String,

    source: BatchableSource<T>,

    #[builder(default = Arc::new(NoOpElementNameValidator))]
    validator: Arc<dyn ElementNameValidator>,

    /// Caps the batch below the connection's maximum batch count.
    #[builder(default, setter(strip_option))]
    max_batch_count: Option<usize>,

    /// Replaces the connection's maximum document size as the limit for a single item.
    #[builder(default, setter(strip_option))]
    max_item_size: Option<usize>,

    #[builder(default, setter(skip))]
    processed: AtomicUsize,
}

impl<T> PayloadSection<T> {
    /// The source the section was built from.
    pub fn source(&self) -> &BatchableSource<T> {
        &self.source
    }

    /// The items that were not part of the last encoded batch.
    pub fn remaining(&self) -> BatchableSource<T> {
        self.source.advanced_past(self.processed.load(Ordering::SeqCst))
    }
}

impl<T: Serialize + Send + Sync> CommandPayload for PayloadSection<T> {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn encode_batch(&self, limits: &BatchLimits) -> Result<PayloadBatch> {
        let split = self.source.can_be_split();
        let max_count = self
            .max_batch_count
            .map_or(limits.max_batch_count, |max| max.min(limits.max_batch_count))
            .max(1);
        let max_item_size = self.max_item_size.unwrap_or(limits.max_item_size);

        let mut batch = PayloadBatch::default();
        for (index, item) in self.source.items().iter().enumerate() {
            if split && index >= max_count {
                break;
            }

            let document = bson::to_raw_document_buf(item)?;
            validate_document(self.validator.as_ref(), &document)?;

            let document_len = document.as_bytes().len();
            if document_len > max_item_size {
                return Err(Error::invalid_argument(format!(
                    "{} item {} is {} bytes, but the maximum is {} bytes",
                    self.identifier,
                    self.source.offset() + index,
                    document_len,
                    max_item_size
                )));
            }

            let entry_size = limits.framing.entry_size(index, document_len);
            if split
                && !batch.documents.is_empty()
                && batch.size_bytes + entry_size > limits.max_batch_size
            {
                break;
            }

            batch.size_bytes += entry_size;
            batch.documents.push(document);
        }

        self.processed.store(batch.documents.len(), Ordering::SeqCst);
        Ok(batch)
    }

    fn processed_count(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }
}
