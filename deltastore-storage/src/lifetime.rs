/// Utility trait to support static lifetime.
/// This is used for components whose lifetime goes through the entire
/// program, and other threads may access them concurrently.
///
/// Using static lifetime eliminates the cost of reference counter
/// maintenance on hot paths.
///
/// # Safety
///
/// After destruction, no thread may access the leaked static
/// reference.
pub unsafe trait StaticLifetime: Sized {
    /// Create a leaked static reference from given instance.
    fn new_static(this: Self) -> &'static Self {
        Box::leak(Box::new(this))
    }

    /// Drop the leaked reference as an owned object.
    ///
    /// # Safety
    ///
    /// Caller must guarantee no thread will access this reference
    /// after it is dropped. If multiple static objects have
    /// dependencies, the drop order matters.
    unsafe fn drop_static(this: &'static Self) {
        unsafe {
            drop(Box::from_raw(this as *const Self as *mut Self));
        }
    }
}
