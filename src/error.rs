quick_error! {
    /// A table or lock error.
    #[derive(Debug, PartialEq, Eq)]
    pub enum Error {
        /// The key is already present in the table.
        ///
        /// Inserts never overwrite. The table is left untouched, and the stored value remains
        /// the one of the first insert. `key` is the rejected key.
        DuplicateKey { key: String } {
            display("Key {:?} is already present in the table.", key)
            description("Duplicate key.")
        }
        /// A bounded-wait lock acquisition reached its deadline.
        ///
        /// The lock is left exactly as if the acquisition was never attempted.
        Timeout {
            display("Timed out while waiting for the lock.")
            description("Lock timeout.")
        }
        /// The bucket array of `buckets` buckets could not be allocated.
        OutOfMemory { buckets: usize } {
            display("Unable to allocate a bucket array of {} buckets.", buckets)
            description("Out of memory.")
        }
    }
}
