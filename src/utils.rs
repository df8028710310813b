/// Smallest number of `page_size`-sized pages needed to hold `bytes`,
/// always at least 1 (a freelist page is written even when empty).
pub(crate) fn page_count(bytes: usize, page_size: usize) -> usize {
    if bytes == 0 {
        1
    } else {
        (bytes + page_size - 1) / page_size
    }
}
