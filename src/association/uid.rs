//! Private utility module for working with UIDs

use std::borrow::Cow;

/// Strip the trailing padding which UID fields may carry on the wire.
/// Conforming peers pad with a single NUL, some pad with spaces.
pub(crate) fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    if uid.ends_with(['\0', ' ']) {
        Cow::Owned(uid.trim_end_matches(['\0', ' ']).to_string())
    } else {
        uid
    }
}
