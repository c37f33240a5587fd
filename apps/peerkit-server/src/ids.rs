use std::fmt;

use uuid::Uuid;

/// Opaque identifier of a live signaling connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ClientId(String);

impl ClientId {
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for ClientId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

fn random_id() -> ClientId {
    // 122 random bits
    ClientId(Uuid::new_v4().simple().to_string())
}

/// Draw ids until one is not `taken`.
pub(crate) fn generate_unique(mut taken: impl FnMut(&ClientId) -> bool) -> ClientId {
    loop {
        let id = random_id();
        if !taken(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_hex_and_distinct() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = generate_unique(|id| seen.contains(id));
            assert_eq!(id.as_str().len(), 32);
            assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn collisions_are_redrawn() {
        let mut rejected = 0;
        let id = generate_unique(|_| {
            rejected += 1;
            rejected <= 3
        });
        assert_eq!(rejected, 4);
        assert!(!id.as_str().is_empty());
    }
}
