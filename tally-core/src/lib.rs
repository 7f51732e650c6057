//! tally-core: domain records, the sync entity contract, and shared utilities

pub mod entity;
pub mod model;
pub mod time;

pub use entity::{SyncEntity, SyncMeta};
pub use model::{
    Account, Category, CategoryKind, SmsMessage, SmsRule, Transaction, TransactionKind,
};

/// Utility for suggesting a category from a merchant or SMS description
pub mod categorizer {
    use super::CategoryKind;

    /// Categorization result
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CategoryResult {
        pub name: &'static str,
        pub kind: CategoryKind,
    }

    const RULES: &[(&str, CategoryKind, &[&str])] = &[
        (
            "Salary",
            CategoryKind::Income,
            &["salary", "payroll", "stipend", "direct deposit"],
        ),
        (
            "Refunds",
            CategoryKind::Income,
            &["refund", "reversal", "cashback"],
        ),
        (
            "Food",
            CategoryKind::Expense,
            &[
                "swiggy",
                "zomato",
                "restaurant",
                "cafe",
                "grocery",
                "bigbasket",
                "doordash",
                "uber eats",
            ],
        ),
        (
            "Transport",
            CategoryKind::Expense,
            &["uber", "ola", "rapido", "metro", "fuel", "petrol", "irctc"],
        ),
        (
            "Bills",
            CategoryKind::Expense,
            &["electricity", "broadband", "recharge", "airtel", "jio", "insurance"],
        ),
        (
            "Subscriptions",
            CategoryKind::Expense,
            &["netflix", "spotify", "prime video", "youtube", "icloud", "github"],
        ),
        (
            "Housing",
            CategoryKind::Expense,
            &["rent", "lease", "maintenance", "landlord"],
        ),
        (
            "Shopping",
            CategoryKind::Expense,
            &["amazon", "flipkart", "myntra", "mall"],
        ),
    ];

    /// Categorize a description by keyword; first matching rule wins.
    pub fn categorize(description: &str) -> Option<CategoryResult> {
        let desc = description.to_lowercase();

        RULES
            .iter()
            .find(|(_, _, keywords)| keywords.iter().any(|k| desc.contains(k)))
            .map(|(name, kind, _)| CategoryResult { name: *name, kind: *kind })
    }

}

pub use categorizer::{categorize, CategoryResult};
