use super::category::OTHER;

/// Keeps the `k` largest categories and folds the rest into a trailing
/// `("other", sum)` entry.
///
/// Sorting is stable on count descending. The overflow entry is omitted
/// when nothing was dropped or the dropped counts sum to zero, so the result
/// holds at most `k + 1` entries. An input `"other"` that survives into the
/// top `k` absorbs the overflow, so at most one `"other"` row is returned.
pub fn collapse<I, K>(category_counts: I, k: usize) -> Vec<(String, u64)>
where
    I: IntoIterator<Item = (K, u64)>,
    K: Into<String>,
{
    let mut entries: Vec<(String, u64)> = category_counts
        .into_iter()
        .map(|(category, count)| (category.into(), count))
        .collect();

    entries.sort_by(|a, b| b.1.cmp(&a.1));

    let overflow: u64 = entries.iter().skip(k).map(|(_, count)| count).sum();
    entries.truncate(k);

    if overflow > 0 {
        match entries.iter_mut().find(|(category, _)| category == OTHER) {
            Some((_, count)) => *count += overflow,
            None => entries.push((OTHER.to_string(), overflow)),
        }
    }

    entries
}
