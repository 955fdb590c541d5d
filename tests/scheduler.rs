// 后台检查调度器测试（暂停时钟）

mod common;

use common::*;
use ota_updater::updater::{BackoffPolicy, CheckScheduler, InstallTopology};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

fn manifest_requests(h: &Harness) -> usize {
    h.transport.requests_for(MANIFEST_URL).len()
}

#[tokio::test(start_paused = true)]
async fn test_background_checks_back_off_then_rest() {
    let h = Harness::new(InstallTopology::Seamless).await;
    h.transport.set_refuse(true);

    let policy = BackoffPolicy {
        initial: Duration::from_secs(10),
        multiplier: 2.0,
        max: Duration::from_secs(1000),
        max_retries: 2,
    };
    let shutdown = CancellationToken::new();
    let start = Instant::now();
    let scheduler = CheckScheduler::new(h.controller.clone(), policy).with_jitter(0.0);
    let handle = tokio::spawn(scheduler.run(shutdown.clone()));

    // 从未检查过：立即检查
    sleep_until(start + Duration::from_secs(1)).await;
    assert_eq!(manifest_requests(&h), 1);

    // 退避 10s、20s
    sleep_until(start + Duration::from_secs(9)).await;
    assert_eq!(manifest_requests(&h), 1);
    sleep_until(start + Duration::from_secs(11)).await;
    assert_eq!(manifest_requests(&h), 2);
    sleep_until(start + Duration::from_secs(29)).await;
    assert_eq!(manifest_requests(&h), 2);
    sleep_until(start + Duration::from_secs(31)).await;
    assert_eq!(manifest_requests(&h), 3);

    // 重试用尽后等待完整间隔
    sleep_until(start + WEEK).await;
    assert_eq!(manifest_requests(&h), 3);
    assert!(h.controller.last_update_check().is_none());

    let data = payload(100, 1);
    h.transport.serve_manifest(&[entry("A", BUILD_TIMESTAMP + 86_400, &data)]);
    h.transport.set_refuse(false);
    sleep_until(start + WEEK + Duration::from_secs(60)).await;
    assert_eq!(manifest_requests(&h), 4);
    assert!(h.controller.last_update_check().is_some());
    assert!(h.controller.get("A").await.is_some());

    // 成功后失败计数归零：下一轮失败重新从 10s 开始退避
    h.transport.set_refuse(true);
    sleep_until(start + WEEK * 2).await;
    assert_eq!(manifest_requests(&h), 4);
    sleep_until(start + WEEK * 2 + Duration::from_secs(35)).await;
    assert_eq!(manifest_requests(&h), 5);
    sleep_until(start + WEEK * 2 + Duration::from_secs(45)).await;
    assert_eq!(manifest_requests(&h), 6);
    sleep_until(start + WEEK * 2 + Duration::from_secs(65)).await;
    assert_eq!(manifest_requests(&h), 7);
    sleep_until(start + WEEK * 2 + Duration::from_secs(3600)).await;
    assert_eq!(manifest_requests(&h), 7);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_stops_on_shutdown() {
    let h = Harness::new(InstallTopology::Seamless).await;
    h.transport.set_refuse(true);

    let shutdown = CancellationToken::new();
    let scheduler = CheckScheduler::new(h.controller.clone(), BackoffPolicy::default());
    let handle = tokio::spawn(scheduler.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(manifest_requests(&h), 1);

    shutdown.cancel();
    handle.await.unwrap();
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(manifest_requests(&h), 1);
}
