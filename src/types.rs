//! Trial table schema
//!
//! Column names shared by every stage. Raw columns come from the task logs;
//! derived columns are appended by the stage that owns them and carried
//! through every later file handoff.

use serde::{Deserialize, Serialize};
use std::fmt;

// Raw trial attributes
pub const USER_ID: &str = "UserId";
pub const DAY: &str = "Day";
pub const REPLAY: &str = "Replay";
pub const ILLEGAL_ITEMS: &str = "IllegalItems";
pub const ILLEGAL_ITEMS_MARKED: &str = "IllegalItemsMarked";
pub const LEGAL_ITEMS: &str = "LegalItems";
pub const LEGAL_ITEMS_MARKED: &str = "LegalItemsMarked";
pub const UNIQUE_TAPS: &str = "UniqueTaps";
pub const ILLEGAL1_MARK_TIME: &str = "Illegal1MarkTime";
pub const TIME_IN_SCANNER: &str = "TimeInScanner";
pub const FIRST_LEGAL_TAP_TIME: &str = "FirstLegalTapTime";
pub const ILLEGAL1_NAME: &str = "Illegal1Name";
pub const ILLEGAL1_COLOR: &str = "Illegal1Color";
pub const BAG_TYPE: &str = "Type";
pub const BAG_TYPE_ID: &str = "TypeId";
pub const ACTIVE_UPGRADES_ID: &str = "ActiveUpgradesId";

// Prep stage
pub const TARGET_PRESENT: &str = "target_present";
pub const TARGET_ABSENT: &str = "target_absent";
pub const TRIAL_NUMBER: &str = "TrialNumber";
pub const TRIAL_RESULT: &str = "TrialResult";
pub const RT: &str = "RT";
pub const LOG_RT: &str = "log_RT";

// Recency stage
pub const COLOR_MATCH: &str = "ColorMatch";
pub const COLOR_MATCH_FLAG: &str = "CurrentTrial_ColorMatch_Flag";
pub const LAST_COLOR_MATCH_TRIAL: &str = "LastColorMatchTrial";
pub const CUMULATIVE_COLOR_AS_ILLEGAL: &str = "Cumulative_Illegal1Color_AsIllegal";
pub const CUMULATIVE_COLOR_AS_LEGAL: &str = "Cumulative_Illegal1Color_AsLegal";

// Cohort stage
pub const AVG_TARGET_PRESENT_ACCURACY: &str = "avg_target_present_accuracy";
pub const AVG_HIT_RT: &str = "avg_hit_RT";
pub const AVG_HIT_LOG_RT: &str = "avg_hit_log_RT";
pub const AVG_HIT_RT_CATEGORY: &str = "avg_hit_RT_Category";
pub const PREVIOUS_TARGET_ID_MATCH: &str = "PreviousTargetIdMatch";
pub const PREVIOUS_TARGET_COND_MATCH: &str = "PreviousTargetCondMatch";
pub const SET_SIZE_CATEGORY: &str = "SetSize_Category";
pub const PLANE: &str = "Plane";
pub const DIFFICULTY_SCORE: &str = "Difficulty_Score";
pub const DIFFICULTY_CATEGORY: &str = "Difficulty_Category";

// Model stage
pub const FITTED_VALUES: &str = "Fitted_Values";
pub const RESIDUALS: &str = "Residuals";

/// `TrialsSinceLast_<event>_ByDay`
pub fn trials_since_column(event: &str) -> String {
    format!("TrialsSinceLast_{event}_ByDay")
}

/// `Cumulative_<event>_ByDay`
pub fn cumulative_column(event: &str) -> String {
    format!("Cumulative_{event}_ByDay")
}

/// `Cumulative_<event>_ByDay_Prob`
pub fn cumulative_prob_column(event: &str) -> String {
    format!("Cumulative_{event}_ByDay_Prob")
}

/// Row and distinct-user counts reported after every filtering step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub rows: usize,
    pub users: usize,
}

impl fmt::Display for TableCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} trials from {} unique users", self.rows, self.users)
    }
}
