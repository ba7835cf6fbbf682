use std::time::{Duration, Instant};

/// Runs `f` and reports how long it took.
pub fn measure<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let tt = Instant::now();
    let val = f();

    (val, tt.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_the_value_through() {
        let (val, _) = measure(|| 42);

        assert_eq!(42, val);
    }
}
