/// Run `f` on a path the optimizer should treat as unlikely, i.e. building a
/// fault.
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
