use crate::ingest::Document;

/// Ordered `(index, document)` pairs sent in one bulk round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
	items: Vec<(String, Document)>,
}

impl Batch {
	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			items: Vec::with_capacity(capacity),
		}
	}

	pub fn push(&mut self, index: impl Into<String>, doc: Document) {
		self.items.push((index.into(), doc));
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &Document)> {
		self.items.iter().map(|(index, doc)| (index.as_str(), doc))
	}

	pub fn into_items(self) -> Vec<(String, Document)> {
		self.items
	}
}

impl FromIterator<(String, Document)> for Batch {
	fn from_iter<T: IntoIterator<Item = (String, Document)>>(iter: T) -> Self {
		Self {
			items: iter.into_iter().collect(),
		}
	}
}

/// Groups a document stream into batches of at most `max_size`, all bound
/// for one index. Arrival order is kept; the last batch may be short.
#[derive(Debug)]
pub struct Batches<I> {
	documents: I,
	index: String,
	max_size: usize,
}

impl<I> Iterator for Batches<I>
where
	I: Iterator<Item = Document>,
{
	type Item = Batch;

	fn next(&mut self) -> Option<Batch> {
		let mut batch = Batch::with_capacity(self.max_size);
		for doc in self.documents.by_ref() {
			batch.push(self.index.as_str(), doc);
			if batch.len() == self.max_size {
				break;
			}
		}
		(!batch.is_empty()).then_some(batch)
	}
}

/// Lazily batch `documents` for `target_index`. A `max_size` of zero is
/// treated as one.
pub fn batch<D>(documents: D, target_index: &str, max_size: usize) -> Batches<D::IntoIter>
where
	D: IntoIterator<Item = Document>,
{
	Batches {
		documents: documents.into_iter(),
		index: target_index.to_owned(),
		max_size: max_size.max(1),
	}
}
