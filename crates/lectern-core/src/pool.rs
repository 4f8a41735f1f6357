// src/pool.rs
use std::io;

/// LIFO free list of reusable objects with a factory for on-demand growth.
///
/// Not thread-safe: every worker owns its own pool.
pub struct Pool<T> {
    free: Vec<T>,
    factory: Box<dyn FnMut() -> io::Result<T>>,
    created: usize,
}

impl<T> Pool<T> {
    pub fn new(factory: impl FnMut() -> io::Result<T> + 'static) -> Self {
        Self {
            free: Vec::new(),
            factory: Box::new(factory),
            created: 0,
        }
    }

    /// Most recently returned object, or a freshly constructed one.
    #[inline]
    pub fn get(&mut self) -> io::Result<T> {
        if let Some(item) = self.free.pop() {
            return Ok(item);
        }
        let item = (self.factory)()?;
        self.created += 1;
        Ok(item)
    }

    #[inline]
    pub fn put(&mut self, item: T) {
        self.free.push(item);
    }

    /// Objects currently idle in the pool.
    #[inline]
    pub fn len(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Objects ever built by the factory; equals the peak number handed out at once.
    #[inline]
    pub fn created(&self) -> usize {
        self.created
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_last_returned_first() {
        let mut next = 0;
        let mut pool = Pool::new(move || {
            next += 1;
            Ok(next)
        });

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_eq!((a, b), (1, 2));

        pool.put(a);
        pool.put(b);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get().unwrap(), 2);
        assert_eq!(pool.get().unwrap(), 1);
        assert_eq!(pool.get().unwrap(), 3);
        assert_eq!(pool.created(), 3);
    }

    #[test]
    fn size_bounded_by_peak_usage() {
        let mut pool = Pool::new(|| Ok(Vec::<u8>::with_capacity(8)));
        for _ in 0..100 {
            let x = pool.get().unwrap();
            let y = pool.get().unwrap();
            pool.put(x);
            pool.put(y);
        }
        assert_eq!(pool.created(), 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn factory_failure_propagates() {
        let mut pool: Pool<u32> = Pool::new(|| Err(io::Error::from_raw_os_error(libc::ENOMEM)));
        assert_eq!(pool.get().unwrap_err().raw_os_error(), Some(libc::ENOMEM));
        pool.put(5);
        assert_eq!(pool.get().unwrap(), 5);
        assert!(pool.is_empty());
    }
}
