#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mcm_host_lib::mock::{MockBench, SharedController};
use mcm_host_lib::{Session, SessionHandle, SessionManager};

pub const SERIAL: &str = "SN123";
pub const SETTLE: Duration = Duration::from_secs(2);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One simulated controller with an open session
pub struct Rig {
    pub bench: MockBench,
    pub manager: SessionManager,
    pub handle: SessionHandle,
    pub session: Arc<Session>,
}

impl Rig {
    pub fn controller(&self) -> SharedController {
        self.bench.controller(SERIAL).expect("controller on bench")
    }
}

pub async fn open_rig() -> Rig {
    init_logging();
    let bench = MockBench::new(&[SERIAL]);
    let manager = bench.manager();
    let handle = manager.open(SERIAL, 115200, 1).await.expect("open");
    let session = manager.session(handle).await.expect("session");
    Rig {
        bench,
        manager,
        handle,
        session,
    }
}
