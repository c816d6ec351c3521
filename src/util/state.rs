/// Bits of a tree bin's `lock_state`. Readers are counted in multiples of
/// `Reader`, so the word holds at most one writer, one waiter and any number
/// of readers at once.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(i64)]
pub enum State {
    None = 0,
    Writer = 1,
    Waiter = 2,
    Reader = 4,
}

impl State {
    #[inline]
    pub const fn bits(self) -> i64 {
        self as i64
    }
}
