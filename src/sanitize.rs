use regex::Regex;
use std::{borrow::Cow, sync::LazyLock};

/// Everything that is not allowed in a user event name.
static DISALLOWED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^A-Za-z0-9_-]+").expect("event name pattern is a valid regex")
});

/// Prefix reserved for protocol events, e.g. `@connection`.
pub const SYSTEM_PREFIX: char = '@';

/// Strip every character outside `[A-Za-z0-9_-]` from an event name.
///
/// Names registered with [`Server::on`], [`Client::on`], names sent with
/// [`Client::send`], and names subscribed to by clients all pass through this
/// function, so a user-chosen name can never begin with [`SYSTEM_PREFIX`].
///
/// ```
/// assert_eq!(evsock::sanitize("he!!o@world"), "heoworld");
/// assert_eq!(evsock::sanitize("chat_room-1"), "chat_room-1");
/// ```
///
/// [`Server::on`]: crate::Server::on
/// [`Client::on`]: crate::Client::on
/// [`Client::send`]: crate::Client::send
pub fn sanitize(name: &str) -> Cow<'_, str> {
    DISALLOWED.replace_all(name, "")
}

/// True if the name is in the reserved system namespace.
pub(crate) fn is_system(name: &str) -> bool {
    name.starts_with(SYSTEM_PREFIX)
}
