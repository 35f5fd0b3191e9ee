pub(crate) fn find_subsequence(haystack: &[String], needle: &[String], start: usize) -> Option<usize> {
    if needle.is_empty() || start > haystack.len() || needle.len() > haystack.len() - start {
        return None;
    }
    'outer: for index in start..=(haystack.len() - needle.len()) {
        for (offset, want) in needle.iter().enumerate() {
            if &haystack[index + offset] != want {
                continue 'outer;
            }
        }
        return Some(index);
    }
    None
}

/// Whitespace-insensitive fallback for [`find_subsequence`]. Collapses runs of
/// whitespace within each line before comparing, so a hunk context line like
/// `fn  greet() {` still matches `fn greet() {` in the file. Returns
/// `Ok(None)` when nothing matches and `Err(count)` when more than one
/// position matches, since silently picking one would risk editing the wrong
/// occurrence.
pub(crate) fn find_subsequence_fuzzy_unique(
    haystack: &[String],
    needle: &[String],
    start: usize,
) -> Result<Option<usize>, usize> {
    if needle.is_empty() || start > haystack.len() || needle.len() > haystack.len() - start {
        return Ok(None);
    }

    let normalized_needle: Vec<String> = needle.iter().map(|line| normalize_line(line)).collect();
    let mut matches = Vec::new();
    for index in start..=(haystack.len() - needle.len()) {
        let is_match = normalized_needle
            .iter()
            .enumerate()
            .all(|(offset, want)| normalize_line(&haystack[index + offset]) == *want);
        if is_match {
            matches.push(index);
        }
    }

    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches[0])),
        count => Err(count),
    }
}

fn normalize_line(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}
