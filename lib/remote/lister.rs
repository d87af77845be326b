//! Normalized views over paginated remote listings.

use tracing::{debug, trace};

use super::{DELIMITER, FORMER_DIRECTORY_MARKER, ListItem, RemoteStore};
use crate::error::RemoteFault;

/// What a listing says about a directory's existence and contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirStatus {
    /// Nothing under the prefix.
    NotExist,
    /// Only the directory's own marker or a former-directory sentinel.
    Empty,
    /// At least one real child.
    NotEmpty,
}

/// Whether `item` names the listed directory itself rather than a child of it.
pub(crate) fn is_self_entry(prefix: &str, item: &ListItem) -> bool {
    let name = item.name();
    !prefix.is_empty() && (name == prefix || name == prefix.trim_end_matches(DELIMITER))
}

/// The immediate child token of `item` under `prefix`, without a trailing delimiter.
///
/// `None` for the prefix itself and for items outside the prefix.
pub(crate) fn child_token<'a>(prefix: &str, item: &'a ListItem) -> Option<&'a str> {
    let token = item
        .name()
        .strip_prefix(prefix)?
        .trim_end_matches(DELIMITER);
    (!token.is_empty() && !token.contains(DELIMITER)).then_some(token)
}

/// Fetch every page of a delimiter listing under `prefix`.
///
/// A page whose first item is the prefix directory itself has that sentinel dropped.
pub async fn list_all<S: RemoteStore>(
    store: &S,
    prefix: &str,
    page_size: usize,
) -> Result<Vec<ListItem>, RemoteFault> {
    let mut items = Vec::new();
    let mut continuation: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = store
            .list(prefix, Some(DELIMITER), continuation.as_deref(), page_size)
            .await?;
        pages += 1;

        let mut page_items = page.items.into_iter().peekable();
        if page_items
            .peek()
            .is_some_and(|first| is_self_entry(prefix, first))
        {
            trace!(prefix, "dropping self sentinel at head of page");
            page_items.next();
        }
        items.extend(page_items);

        match page.continuation {
            Some(token) => continuation = Some(token),
            None => break,
        }
    }

    debug!(prefix, pages, count = items.len(), "listed remote prefix");
    Ok(items)
}

/// Decide whether the directory `name` exists remotely and whether it has children.
///
/// An empty page that still carries a continuation token is retried at most `retry_cap`
/// times; once the cap is hit the evidence gathered so far decides.
pub async fn probe_directory<S: RemoteStore>(
    store: &S,
    name: &str,
    page_size: usize,
    retry_cap: usize,
) -> Result<DirStatus, RemoteFault> {
    let prefix = if name.is_empty() {
        String::new()
    } else {
        format!("{}{DELIMITER}", name.trim_end_matches(DELIMITER))
    };

    let mut status = DirStatus::NotExist;
    let mut continuation: Option<String> = None;
    let mut empty_pages = 0usize;

    loop {
        let page = store
            .list(&prefix, Some(DELIMITER), continuation.as_deref(), page_size)
            .await?;

        for item in &page.items {
            if is_self_entry(&prefix, item) {
                status = DirStatus::Empty;
                continue;
            }
            match child_token(&prefix, item) {
                Some(FORMER_DIRECTORY_MARKER) => status = DirStatus::Empty,
                Some(_) => return Ok(DirStatus::NotEmpty),
                None => {}
            }
        }

        let Some(token) = page.continuation else {
            break;
        };
        if page.items.is_empty() {
            empty_pages += 1;
            if empty_pages > retry_cap {
                debug!(name, empty_pages, "giving up on empty continuation pages");
                break;
            }
        }
        continuation = Some(token);
    }

    Ok(status)
}
