//! Fixed-size, order-preserving batching of record folders.

use crate::error::IngestError;

/// Splits `items` into contiguous groups of `size`; the last group may be shorter.
///
/// The returned iterator is lazy and borrows from `items`, so restarting is a
/// matter of calling `partition` again on the same slice.
pub fn partition<T>(
    items: &[T],
    size: usize,
) -> Result<impl Iterator<Item = &[T]> + '_, IngestError> {
    if size == 0 {
        return Err(IngestError::InvalidConfiguration(
            "batch group size must be a positive integer".to_string(),
        ));
    }
    Ok(items.chunks(size))
}

/// Number of batches `partition` yields for `len` items, i.e. `ceil(len / size)`.
pub fn batch_count(len: usize, size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    len.div_ceil(size)
}
