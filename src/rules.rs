//! Pure business rules for the user master and the monthly-report workflow.
//! Nothing in here touches the database; handlers feed in plain values and
//! persist the results inside their own transactions.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Applicant,
    Approver,
    Admin,
}

/// Static code table. `as_code` / `from_code` must stay inverses.
const ROLE_CODES: [(Role, &str); 3] = [
    (Role::Applicant, "applicant"),
    (Role::Approver, "approver"),
    (Role::Admin, "admin"),
];

impl Role {
    pub fn as_code(self) -> &'static str {
        ROLE_CODES
            .iter()
            .find(|(r, _)| *r == self)
            .map(|(_, c)| *c)
            .unwrap_or("applicant")
    }

    pub fn from_code(code: &str) -> Option<Role> {
        ROLE_CODES
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(r, _)| *r)
    }
}

/// Explicit set of role memberships for one user. The stored role rows are
/// replaced wholesale from this set on every register/update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoleSet {
    pub applicant: bool,
    pub approver: bool,
    pub admin: bool,
}

impl RoleSet {
    pub fn from_flags(applicant: bool, approver: bool, admin: bool) -> RoleSet {
        RoleSet {
            applicant,
            approver,
            admin,
        }
    }

    pub fn insert(&mut self, role: Role) {
        match role {
            Role::Applicant => self.applicant = true,
            Role::Approver => self.approver = true,
            Role::Admin => self.admin = true,
        }
    }

    pub fn contains(&self, role: Role) -> bool {
        match role {
            Role::Applicant => self.applicant,
            Role::Approver => self.approver,
            Role::Admin => self.admin,
        }
    }

    /// Roles in a fixed order, one row per member.
    pub fn iter(&self) -> impl Iterator<Item = Role> + '_ {
        [Role::Applicant, Role::Approver, Role::Admin]
            .into_iter()
            .filter(|r| self.contains(*r))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    /// Two or more non-empty approver slots hold the same user.
    DuplicateApprover,
    /// The user is an applicant but the escalation slot (3) is empty.
    MissingRequiredApprover,
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::DuplicateApprover => {
                write!(f, "the same approver may not appear in more than one slot")
            }
            RouteError::MissingRequiredApprover => {
                write!(f, "approver 3 is required for users with the applicant role")
            }
        }
    }
}

fn slot_value(slot: Option<&str>) -> Option<&str> {
    match slot {
        Some(s) => {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t)
            }
        }
        None => None,
    }
}

fn slots_collide(a: Option<&str>, b: Option<&str>) -> bool {
    match (slot_value(a), slot_value(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Approval-route constraints:
/// - the three slots must be pairwise distinct where populated (empty slots
///   never collide),
/// - slot 3 is mandatory when the owner holds the applicant role.
/// Slots may otherwise be sparsely populated in any combination.
pub fn validate_approval_route(
    is_applicant: bool,
    approver1: Option<&str>,
    approver2: Option<&str>,
    approver3: Option<&str>,
) -> Result<(), RouteError> {
    if slots_collide(approver1, approver2)
        || slots_collide(approver1, approver3)
        || slots_collide(approver2, approver3)
    {
        return Err(RouteError::DuplicateApprover);
    }

    if is_applicant && slot_value(approver3).is_none() {
        return Err(RouteError::MissingRequiredApprover);
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    PendingLevel1,
    PendingLevel2,
    PendingLevel3,
    Approved,
}

impl ReportStatus {
    pub fn as_code(self) -> &'static str {
        match self {
            ReportStatus::PendingLevel1 => "pending_l1",
            ReportStatus::PendingLevel2 => "pending_l2",
            ReportStatus::PendingLevel3 => "pending_l3",
            ReportStatus::Approved => "approved",
        }
    }

    pub fn from_code(code: &str) -> Option<ReportStatus> {
        match code {
            "pending_l1" => Some(ReportStatus::PendingLevel1),
            "pending_l2" => Some(ReportStatus::PendingLevel2),
            "pending_l3" => Some(ReportStatus::PendingLevel3),
            "approved" => Some(ReportStatus::Approved),
            _ => None,
        }
    }

    /// Which approver slot a pending report is waiting on, if any.
    pub fn pending_slot(self) -> Option<u8> {
        match self {
            ReportStatus::PendingLevel1 => Some(1),
            ReportStatus::PendingLevel2 => Some(2),
            ReportStatus::PendingLevel3 => Some(3),
            ReportStatus::Approved => None,
        }
    }
}

/// Initial status at submission time, from whichever slot is populated
/// first. Level 3 is the fallback even when slot 3 itself is empty.
pub fn initial_report_status(
    approver1: Option<&str>,
    approver2: Option<&str>,
    _approver3: Option<&str>,
) -> ReportStatus {
    if slot_value(approver1).is_some() {
        ReportStatus::PendingLevel1
    } else if slot_value(approver2).is_some() {
        ReportStatus::PendingLevel2
    } else {
        ReportStatus::PendingLevel3
    }
}

/// After the current level's approver approves, the report moves to the next
/// populated slot, or straight to approved when no later slot is populated.
pub fn next_status_after_approval(
    current: ReportStatus,
    approver2: Option<&str>,
    approver3: Option<&str>,
) -> ReportStatus {
    match current {
        ReportStatus::PendingLevel1 => {
            if slot_value(approver2).is_some() {
                ReportStatus::PendingLevel2
            } else if slot_value(approver3).is_some() {
                ReportStatus::PendingLevel3
            } else {
                ReportStatus::Approved
            }
        }
        ReportStatus::PendingLevel2 => {
            if slot_value(approver3).is_some() {
                ReportStatus::PendingLevel3
            } else {
                ReportStatus::Approved
            }
        }
        ReportStatus::PendingLevel3 | ReportStatus::Approved => ReportStatus::Approved,
    }
}
