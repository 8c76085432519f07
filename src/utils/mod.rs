mod id_gen;
mod only;

pub use id_gen::{IdGenerator, NameGenerator};
pub use only::IntoOnly;

#[cfg(test)]
#[allow(dead_code)]
pub fn diff(a: &str, b: &str) -> String {
    use similar_asserts::SimpleDiff;
    SimpleDiff::from_str(a, b, "left", "right").to_string()
}

pub trait OrMap<T> {
    /// Merges two options into one using `f`.
    /// If one of the options is None, results defaults to the other one.
    fn or_map<F>(self, b: Self, f: F) -> Self
    where
        F: FnOnce(T, T) -> T;
}

impl<T> OrMap<T> for Option<T> {
    fn or_map<F>(self, b: Self, f: F) -> Self
    where
        F: FnOnce(T, T) -> T,
    {
        match (self, b) {
            (Some(a), Some(b)) => Some(f(a, b)),
            (a, None) => a,
            (None, b) => b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::OrMap;

    #[test]
    fn or_map_defaults_to_the_present_side() {
        assert_eq!(Some(1).or_map(Some(2), |a, b| a + b), Some(3));
        assert_eq!(Some(1).or_map(None, |a, b| a + b), Some(1));
        assert_eq!(None.or_map(Some(2), |a, b| a + b), Some(2));
        assert_eq!(None::<i32>.or_map(None, |a, b| a + b), None);
    }
}
