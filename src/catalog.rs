use crate::error::{CreditsError, Result};

/// One purchasable credit bundle. `product_path` is the reference the
/// checkout widget resolves; `key` is what the rest of the app passes
/// around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditPackage {
    pub key: &'static str,
    pub product_path: &'static str,
    pub credits: u64,
    pub display_name: &'static str,
}

const PACKAGES: &[CreditPackage] = &[
    CreditPackage {
        key: "novice-sack",
        product_path: "quillia-credits-100",
        credits: 100,
        display_name: "Novice's Sack",
    },
    CreditPackage {
        key: "adventurer-chest",
        product_path: "quillia-credits-550",
        credits: 550,
        display_name: "Adventurer's Chest",
    },
    CreditPackage {
        key: "hero-hoard",
        product_path: "quillia-credits-1200",
        credits: 1200,
        display_name: "Hero's Hoard",
    },
];

pub fn all_packages() -> &'static [CreditPackage] {
    PACKAGES
}

pub fn find_package(key: &str) -> Option<&'static CreditPackage> {
    let key = key.trim();
    PACKAGES.iter().find(|package| package.key == key)
}

pub fn require_package(key: &str) -> Result<&'static CreditPackage> {
    find_package(key).ok_or_else(|| CreditsError::UnknownPackage(key.trim().to_owned()))
}

#[cfg(test)]
mod tests {
    use super::{all_packages, find_package, require_package};
    use crate::error::CreditsError;

    #[test]
    fn finds_known_package_ignoring_surrounding_whitespace() {
        let package = find_package(" novice-sack ").expect("expected package");
        assert_eq!(package.credits, 100);
        assert_eq!(package.product_path, "quillia-credits-100");
    }

    #[test]
    fn rejects_unknown_package_key() {
        let err = require_package("mystery-crate").unwrap_err();
        assert!(matches!(err, CreditsError::UnknownPackage(key) if key == "mystery-crate"));
    }

    #[test]
    fn package_keys_are_unique() {
        let packages = all_packages();
        for (i, a) in packages.iter().enumerate() {
            for b in &packages[(i + 1)..] {
                assert_ne!(a.key, b.key);
                assert_ne!(a.product_path, b.product_path);
            }
        }
    }
}
