//! Confirmation Gate

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// 확인 헤더 이름
pub const CONFIRM_HEADER: &str = "X-Confirm-Action";

/// 확인 헤더 값 (대소문자 무시)
pub const CONFIRM_HEADER_VALUE: &str = "yes";

/// 2차 확인이 필요한 작업
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DangerousAction {
    /// 컨테이너 삭제
    RemoveContainer,
    /// 컨테이너 강제 종료
    Kill,
    /// 여러 컨테이너 일괄 중지
    BatchStop,
    /// 이미지 삭제
    RemoveImage,
    /// 워크스페이스 삭제
    DeleteWorkspace,
    /// compose override 삭제
    ClearOverride,
    /// 캐시 없이 재빌드
    ForceRebuild,
    /// 컨테이너 강제 재생성
    ForceRecreate,
}

impl DangerousAction {
    pub const ALL: [DangerousAction; 8] = [
        DangerousAction::RemoveContainer,
        DangerousAction::Kill,
        DangerousAction::BatchStop,
        DangerousAction::RemoveImage,
        DangerousAction::DeleteWorkspace,
        DangerousAction::ClearOverride,
        DangerousAction::ForceRebuild,
        DangerousAction::ForceRecreate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoveContainer => "remove-container",
            Self::Kill => "kill",
            Self::BatchStop => "batch-stop",
            Self::RemoveImage => "remove-image",
            Self::DeleteWorkspace => "delete-workspace",
            Self::ClearOverride => "clear-override",
            Self::ForceRebuild => "force-rebuild",
            Self::ForceRecreate => "force-recreate",
        }
    }
}

impl std::fmt::Display for DangerousAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 요청에 실려 온 확인 정보
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Confirmation {
    /// `confirm` 쿼리/본문 플래그
    pub flag: bool,
    /// `X-Confirm-Action` 헤더 값
    pub header: Option<String>,
}

impl Confirmation {
    pub fn new(flag: bool, header: Option<String>) -> Self {
        Self { flag, header }
    }

    /// 확인 없음
    pub fn none() -> Self {
        Self::default()
    }

    /// 플래그로 확인
    pub fn confirmed() -> Self {
        Self {
            flag: true,
            header: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.flag
            || self
                .header
                .as_deref()
                .map(|v| v.trim().eq_ignore_ascii_case(CONFIRM_HEADER_VALUE))
                .unwrap_or(false)
    }
}

/// 확인이 없으면 `ConfirmationMissing` 반환. 부작용 없음.
pub fn require_confirmation(confirmation: &Confirmation, action: DangerousAction) -> Result<()> {
    if confirmation.is_confirmed() {
        return Ok(());
    }
    Err(Error::confirmation_missing(action.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_satisfies_gate() {
        assert!(require_confirmation(&Confirmation::confirmed(), DangerousAction::Kill).is_ok());
    }

    #[test]
    fn test_header_satisfies_gate_case_insensitive() {
        let c = Confirmation::new(false, Some("YES".to_string()));
        assert!(require_confirmation(&c, DangerousAction::RemoveImage).is_ok());
    }

    #[test]
    fn test_wrong_header_value_rejected() {
        let c = Confirmation::new(false, Some("true".to_string()));
        let err = require_confirmation(&c, DangerousAction::DeleteWorkspace).unwrap_err();
        match err {
            Error::ConfirmationMissing { action } => assert_eq!(action, "delete-workspace"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_absent_confirmation_rejected_for_every_action() {
        for action in DangerousAction::ALL {
            assert!(require_confirmation(&Confirmation::none(), action).is_err());
        }
    }
}
