use chrono::{Duration, SubsecRound, Utc};
use netprobe_agent::conf::{Conf, SchedulerConf};
use netprobe_agent::scheduler::{Interval, Scheduler, Task};
use netprobe_agent::TestType;
use std::sync::Arc;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn conf(dir: &tempfile::TempDir, base_url: String) -> SchedulerConf {
    SchedulerConf {
        base_url,
        schedule_path: dir.path().join("state/schedule.json"),
        check_interval_secs: 1,
        ..SchedulerConf::default()
    }
}

#[tokio::test]
async fn export_then_import_restores_every_task() {
    let dir = tempfile::tempdir().unwrap();
    let s = Scheduler::new(conf(&dir, String::from("http://127.0.0.1:8080")));
    let when = Utc::now().trunc_subsecs(0) + Duration::days(3);

    s.add_task(Task::test("icmp-daily", TestType::Icmp, when).every(Interval::Daily))
        .await
        .unwrap();
    s.add_task(Task::chart("latency-month", "latency", Some(30), when).every(Interval::Monthly))
        .await
        .unwrap();
    s.add_task(Task::chart("tcp-today", "tcp", None, when)).await.unwrap();

    let export = dir.path().join("export/backup.json");
    s.export_schedule(&export).await.unwrap();

    let fresh = Scheduler::new(conf(&dir, String::from("http://127.0.0.1:8080")));
    assert_eq!(fresh.import_schedule(&export).await.unwrap(), 3);
    assert_eq!(fresh.list_tasks().await, s.list_tasks().await);
}

#[tokio::test]
async fn started_scheduler_fires_due_tasks_at_its_own_api() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/networktest"))
        .and(query_param("test", "tcp"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/charts/generate-historic"))
        .and(query_param("test", "icmp"))
        .and(query_param("days", "7"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let past = Utc::now() - Duration::minutes(10);
    {
        // seed the schedule file the scheduler loads on start
        let seed = Scheduler::new(conf(&dir, server.uri()));
        seed.add_task(Task::test("tcp-once", TestType::Tcp, past)).await.unwrap();
        seed.add_task(Task::chart("icmp-week", "icmp", Some(7), past).every(Interval::Weekly))
            .await
            .unwrap();
    }

    let s = Arc::new(Scheduler::new(conf(&dir, server.uri())));
    s.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let received = server.received_requests().await.unwrap_or_default();
        if received.len() >= 2 || tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    s.stop().await.unwrap();
    server.verify().await;

    let once = s.get_task("tcp-once").await.unwrap();
    assert!(!once.active);
    let weekly = s.get_task("icmp-week").await.unwrap();
    assert!(weekly.active);
    assert!(weekly.date_time > Utc::now());
}

#[test]
fn shipped_config_parses() {
    let conf = Conf::from_toml(include_str!("../config.toml")).unwrap();
    assert_eq!(conf.tcp.ports, vec![80, 443]);
    assert_eq!(conf.scheduler.workers, 4);
}
