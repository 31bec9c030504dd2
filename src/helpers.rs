use once_cell::sync::OnceCell;

/// Thread-safe compute-once cell.
///
/// The cell is either empty, being initialized, or holding its value.
/// Concurrent callers of [MemoCell::get_or_try_init] block while another thread initializes it,
/// so the initializer runs at most once successfully and all callers observe the same value.
/// A failed initialization leaves the cell empty.
pub struct MemoCell<T>(OnceCell<T>);

impl<T: Clone> MemoCell<T> {
    pub fn new() -> Self {
        Self(OnceCell::new())
    }

    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        self.0.get_or_try_init(init).cloned()
    }

    /// The cached value, without triggering its computation
    pub fn get(&self) -> Option<&T> {
        self.0.get()
    }

    pub fn is_present(&self) -> bool {
        self.0.get().is_some()
    }
}

impl<T: Clone> Default for MemoCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Register an implementation type built by constructor injection.
///
/// The implementation type must implement [Injectable](crate::Injectable).
/// It can be bound to itself or to a trait object it implements.
///
/// ```ignore
/// bind!(registry, Singleton, dyn Greeter => FriendlyGreeter);
/// bind!(registry, Transient, FriendlyGreeter);
/// ```
#[macro_export]
macro_rules! bind {
    ($registry:expr, $lifetime:ident, $Service:ty => $Concrete:ty) => {
        $registry.add_type::<$Service, $Concrete, _>(
            $crate::Lifetime::$lifetime,
            |concrete: $Concrete| -> ::std::sync::Arc<$Service> { ::std::sync::Arc::new(concrete) },
        )
    };
    ($registry:expr, $lifetime:ident, $Concrete:ty) => {
        $crate::bind!($registry, $lifetime, $Concrete => $Concrete)
    };
}
