use std::sync::OnceLock;

static QUIET: OnceLock<bool> = OnceLock::new();

/// `HAYSTACK_QUIET=1` (or `true`) turns off banners and spinners
pub fn is_quiet() -> bool {
    *QUIET.get_or_init(|| {
        std::env::var("HAYSTACK_QUIET")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}
