//! Config - 통합 설정 관리
//!
//! - `harbor.rs` - HarborConfig (경로, 워커 수, 런타임 연결, HTTP 바인딩)
//!
//! 로드 순서: 글로벌 JSON -> 프로젝트 JSON -> `HARBOR_*` 환경 변수.
//! CLI 플래그는 바이너리에서 마지막으로 덮어쓴다.

mod harbor;

pub use harbor::{HarborConfig, DEFAULT_ACTOR_HEADER, DEFAULT_WORKERS, HARBOR_CONFIG_FILE};
