//! Known datasets and their columns.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// A dataset (table) that change messages may target.
///
/// Every variant except [`Dataset::Prefs`] maps to a table with a fixed set
/// of columns. `Prefs` is the reserved preferences dataset: its rows are
/// preference keys and its values go to the preference store instead of a
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Dataset {
    Accounts,
    Banks,
    Categories,
    CategoryGroups,
    /// Aliases between merged categories.
    CategoryMapping,
    Payees,
    /// Aliases between merged payees.
    PayeeMapping,
    Transactions,
    /// Free-form notes keyed by the id of the annotated entity.
    Notes,
    Rules,
    Schedules,
    SchedulesNextDate,
    /// Tracking-budget cells.
    ReflectBudgets,
    /// Envelope-budget cells.
    ZeroBudgets,
    ZeroBudgetMonths,
    /// Saved transaction filters.
    TransactionFilters,
    CustomReports,
    /// Dashboard widgets.
    Dashboard,
    /// Synced budget preferences stored as a table.
    Preferences,
    /// Reserved dynamic preferences dataset.
    Prefs,
}

/// Error for a dataset name that is not known.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown dataset {0:?}")]
pub struct UnknownDataset(pub String);

const BUDGET_COLUMNS: &[&str] = &[
    "month", "category", "amount", "carryover", "goal", "long_goal",
];

impl Dataset {
    /// Every dataset, tables first.
    pub const ALL: [Dataset; 20] = [
        Dataset::Accounts,
        Dataset::Banks,
        Dataset::Categories,
        Dataset::CategoryGroups,
        Dataset::CategoryMapping,
        Dataset::Payees,
        Dataset::PayeeMapping,
        Dataset::Transactions,
        Dataset::Notes,
        Dataset::Rules,
        Dataset::Schedules,
        Dataset::SchedulesNextDate,
        Dataset::ReflectBudgets,
        Dataset::ZeroBudgets,
        Dataset::ZeroBudgetMonths,
        Dataset::TransactionFilters,
        Dataset::CustomReports,
        Dataset::Dashboard,
        Dataset::Preferences,
        Dataset::Prefs,
    ];

    /// Name used on the wire and as the table name.
    pub fn name(self) -> &'static str {
        match self {
            Dataset::Accounts => "accounts",
            Dataset::Banks => "banks",
            Dataset::Categories => "categories",
            Dataset::CategoryGroups => "category_groups",
            Dataset::CategoryMapping => "category_mapping",
            Dataset::Payees => "payees",
            Dataset::PayeeMapping => "payee_mapping",
            Dataset::Transactions => "transactions",
            Dataset::Notes => "notes",
            Dataset::Rules => "rules",
            Dataset::Schedules => "schedules",
            Dataset::SchedulesNextDate => "schedules_next_date",
            Dataset::ReflectBudgets => "reflect_budgets",
            Dataset::ZeroBudgets => "zero_budgets",
            Dataset::ZeroBudgetMonths => "zero_budget_months",
            Dataset::TransactionFilters => "transaction_filters",
            Dataset::CustomReports => "custom_reports",
            Dataset::Dashboard => "dashboard",
            Dataset::Preferences => "preferences",
            Dataset::Prefs => "prefs",
        }
    }

    /// Look up a dataset by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.name() == name)
    }

    /// Whether this is the reserved preferences dataset.
    pub fn is_prefs(self) -> bool {
        self == Dataset::Prefs
    }

    /// Datasets backed by a table.
    pub fn tables() -> impl Iterator<Item = Dataset> {
        Self::ALL.into_iter().filter(|d| !d.is_prefs())
    }

    /// Columns of the table, excluding the `id` key. Empty for `Prefs`.
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Dataset::Accounts => &[
                "name",
                "offbudget",
                "closed",
                "sort_order",
                "account_id",
                "balance_current",
                "balance_available",
                "balance_limit",
                "mask",
                "official_name",
                "type",
                "subtype",
                "bank",
                "account_sync_source",
                "tombstone",
            ],
            Dataset::Banks => &["name", "bank_id", "tombstone"],
            Dataset::Categories => &[
                "name",
                "is_income",
                "cat_group",
                "sort_order",
                "hidden",
                "goal_def",
                "tombstone",
            ],
            Dataset::CategoryGroups => &["name", "is_income", "sort_order", "hidden", "tombstone"],
            Dataset::CategoryMapping => &["transferId"],
            Dataset::Payees => &[
                "name",
                "transfer_acct",
                "favorite",
                "learn_categories",
                "tombstone",
                "category",
            ],
            Dataset::PayeeMapping => &["targetId"],
            Dataset::Transactions => &[
                "isParent",
                "isChild",
                "acct",
                "category",
                "amount",
                "description",
                "notes",
                "date",
                "parent_id",
                "financial_id",
                "error",
                "imported_description",
                "transferred_id",
                "schedule",
                "sort_order",
                "starting_balance_flag",
                "tombstone",
                "cleared",
                "reconciled",
                "pending",
                "location",
                "type",
            ],
            Dataset::Notes => &["note"],
            Dataset::Rules => &["stage", "conditions", "actions", "tombstone", "conditions_op"],
            Dataset::Schedules => &[
                "name",
                "rule",
                "active",
                "completed",
                "posts_transaction",
                "tombstone",
            ],
            Dataset::SchedulesNextDate => &[
                "schedule_id",
                "local_next_date",
                "local_next_date_ts",
                "base_next_date",
                "base_next_date_ts",
                "tombstone",
            ],
            Dataset::ReflectBudgets | Dataset::ZeroBudgets => BUDGET_COLUMNS,
            Dataset::ZeroBudgetMonths => &["buffered"],
            Dataset::TransactionFilters => &["name", "conditions", "conditions_op", "tombstone"],
            Dataset::CustomReports => &[
                "name",
                "start_date",
                "end_date",
                "date_static",
                "date_range",
                "mode",
                "group_by",
                "balance_type",
                "show_empty",
                "show_offbudget",
                "show_hidden",
                "show_uncateogorized",
                "selected_categories",
                "graph_type",
                "conditions",
                "conditions_op",
                "metadata",
                "interval",
                "color_scheme",
                "include_current",
                "sort_by",
                "tombstone",
            ],
            Dataset::Dashboard => &["type", "width", "height", "x", "y", "meta", "tombstone"],
            Dataset::Preferences => &["value"],
            Dataset::Prefs => &[],
        }
    }

    /// Whether `column` belongs to this dataset. Any column is accepted for
    /// `Prefs`.
    pub fn has_column(self, column: &str) -> bool {
        self.is_prefs() || self.columns().contains(&column)
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dataset {
    type Err = UnknownDataset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| UnknownDataset(s.to_string()))
    }
}
