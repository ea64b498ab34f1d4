//! Host-list expressions such as `n[0-3,7],gpu[01-02],login`.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostListError {
    #[error("empty host list")]
    Empty,
    #[error("unbalanced brackets in '{0}'")]
    Unbalanced(String),
    #[error("invalid range '{0}'")]
    InvalidRange(String),
}

/// Upper bound on the number of names one expression may expand to.
const MAX_EXPANSION: usize = 65_536;

pub fn expand(expr: &str) -> Result<Vec<String>, HostListError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(HostListError::Empty);
    }

    let mut hosts = Vec::new();
    for item in split_top_level(expr)? {
        let item = item.trim();
        if item.is_empty() {
            return Err(HostListError::Empty);
        }
        expand_item(item, &mut hosts)?;
        if hosts.len() > MAX_EXPANSION {
            return Err(HostListError::InvalidRange(item.to_string()));
        }
    }
    Ok(hosts)
}

/// True when `host` is one of the names described by `expr`.
pub fn contains(expr: &str, host: &str) -> Result<bool, HostListError> {
    Ok(expand(expr)?.iter().any(|candidate| candidate == host))
}

fn split_top_level(expr: &str) -> Result<Vec<&str>, HostListError> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in expr.char_indices() {
        match ch {
            '[' => {
                if depth > 0 {
                    return Err(HostListError::Unbalanced(expr.to_string()));
                }
                depth += 1;
            }
            ']' => {
                if depth == 0 {
                    return Err(HostListError::Unbalanced(expr.to_string()));
                }
                depth -= 1;
            }
            ',' if depth == 0 => {
                items.push(&expr[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(HostListError::Unbalanced(expr.to_string()));
    }
    items.push(&expr[start..]);
    Ok(items)
}

fn expand_item(item: &str, out: &mut Vec<String>) -> Result<(), HostListError> {
    let Some(open) = item.find('[') else {
        out.push(item.to_string());
        return Ok(());
    };
    let close = item
        .find(']')
        .ok_or_else(|| HostListError::Unbalanced(item.to_string()))?;
    let prefix = &item[..open];
    let suffix = &item[close + 1..];
    let body = &item[open + 1..close];

    for range in body.split(',') {
        let range = range.trim();
        let (lo, hi) = match range.split_once('-') {
            Some((lo, hi)) => (lo, hi),
            None => (range, range),
        };
        let width = lo.len();
        let lo_num: u64 = lo
            .parse()
            .map_err(|_| HostListError::InvalidRange(range.to_string()))?;
        let hi_num: u64 = hi
            .parse()
            .map_err(|_| HostListError::InvalidRange(range.to_string()))?;
        if hi_num < lo_num || (hi_num - lo_num) as usize > MAX_EXPANSION {
            return Err(HostListError::InvalidRange(range.to_string()));
        }
        for n in lo_num..=hi_num {
            out.push(format!("{prefix}{n:0width$}{suffix}"));
        }
    }
    Ok(())
}
