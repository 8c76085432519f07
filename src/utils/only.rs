use anyhow::{anyhow, Result};

pub trait IntoOnly {
    type Item;

    fn into_only(self) -> Result<Self::Item>;
}

impl<T> IntoOnly for Vec<T> {
    type Item = T;

    fn into_only(mut self) -> Result<Self::Item> {
        match self.len() {
            1 => Ok(self.remove(0)),
            0 => Err(anyhow!("expected one element, but found none")),
            _ => Err(anyhow!("expected one element, but found more")),
        }
    }
}
