//! Permission - 위험 작업 2차 확인
//!
//! 파괴적이거나 되돌릴 수 없는 작업은 요청 시점에 명시적 확인이 필요하다.
//! 확인은 쿼리 플래그(`confirm=true`) 또는 `X-Confirm-Action: yes` 헤더 중
//! 하나로 충족되며, 확인이 없으면 작업 행이 만들어지기 전에 거부된다.

mod confirm;

pub use confirm::{
    require_confirmation, Confirmation, DangerousAction, CONFIRM_HEADER, CONFIRM_HEADER_VALUE,
};
