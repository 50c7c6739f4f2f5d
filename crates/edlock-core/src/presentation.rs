//! Presentation adapter: lock state to UI affordances
//!
//! A pure mapping from [`LockSnapshot`] to badge, spectator overlay, and
//! gated controls. No business logic lives here and nothing here feeds back
//! into the coordinator.

use serde::{Deserialize, Serialize};

use crate::coordinator::{Connectivity, CoordinatorState, LockSnapshot};

/// Status badge shown next to the record title
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Badge {
    /// Held with a healthy connection
    Editing,
    /// Nominally held, but the server is currently unverifiable
    EditingUncertain,
    /// Someone else is editing
    ReadOnly,
    /// The operator's own other tab is editing
    OwnElsewhere,
    /// A duplicate coordinator in this very tab is editing
    DuplicateTab,
    /// Status or acquisition in flight
    Checking,
    /// Lost, released, or errored; an explicit restart is needed
    Unavailable,
}

/// Interactive control gated by lock state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    Edit,
    Save,
    TakeOver,
    RequestAccess,
}

/// The one action worth offering prominently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryAction {
    /// Ask the holder for ownership
    RequestAccess,
    /// Reclaim from our own other tab
    TakeOver,
    /// Re-run the lock check
    Retry,
}

/// Banner shown to spectators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectatorOverlay {
    pub holder_name: Option<String>,
    pub same_owner: bool,
}

/// Render-ready description of lock state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub badge: Badge,
    pub overlay: Option<SpectatorOverlay>,
    pub disabled_controls: Vec<Control>,
    pub primary_action: Option<PrimaryAction>,
}

/// Map a lock snapshot onto UI affordances
pub fn view_state(snapshot: &LockSnapshot) -> ViewState {
    match &snapshot.state {
        CoordinatorState::Checking | CoordinatorState::Acquiring => ViewState {
            badge: Badge::Checking,
            overlay: None,
            disabled_controls: vec![
                Control::Edit,
                Control::Save,
                Control::TakeOver,
                Control::RequestAccess,
            ],
            primary_action: None,
        },
        CoordinatorState::Held { .. } => ViewState {
            badge: match snapshot.connectivity {
                Connectivity::Ok => Badge::Editing,
                Connectivity::Uncertain => Badge::EditingUncertain,
            },
            overlay: None,
            disabled_controls: vec![Control::TakeOver, Control::RequestAccess],
            primary_action: None,
        },
        CoordinatorState::Blocked {
            holder,
            same_owner,
            same_tab,
        } => {
            let overlay = Some(SpectatorOverlay {
                holder_name: holder.as_ref().map(|h| h.display_name.clone()),
                same_owner: *same_owner,
            });
            if *same_tab {
                ViewState {
                    badge: Badge::DuplicateTab,
                    overlay,
                    disabled_controls: vec![
                        Control::Edit,
                        Control::Save,
                        Control::TakeOver,
                        Control::RequestAccess,
                    ],
                    primary_action: None,
                }
            } else if *same_owner {
                ViewState {
                    badge: Badge::OwnElsewhere,
                    overlay,
                    disabled_controls: vec![Control::Edit, Control::Save, Control::RequestAccess],
                    primary_action: Some(PrimaryAction::TakeOver),
                }
            } else {
                ViewState {
                    badge: Badge::ReadOnly,
                    overlay,
                    disabled_controls: vec![Control::Edit, Control::Save, Control::TakeOver],
                    primary_action: Some(PrimaryAction::RequestAccess),
                }
            }
        }
        CoordinatorState::Lost
        | CoordinatorState::Released
        | CoordinatorState::Error { .. } => ViewState {
            badge: Badge::Unavailable,
            overlay: None,
            disabled_controls: vec![
                Control::Edit,
                Control::Save,
                Control::TakeOver,
                Control::RequestAccess,
            ],
            primary_action: Some(PrimaryAction::Retry),
        },
    }
}
