use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use omron_eip_bridge::comm::core::codec::DecodedValue;
use omron_eip_bridge::comm::core::descriptor::DescriptorError;
use omron_eip_bridge::comm::core::model::{OptimisationState, Quality, INIT_POLLER};
use omron_eip_bridge::comm::{EipDriver, MockTransport};

const CONFIG: &str = r#"{
  "schemaVersion": 1,
  "gateway": "192.168.250.1",
  "path": "1,0",
  "readTimeoutMs": 200,
  "structFile": "structs.csv",
  "pollers": [
    { "name": "testPoller", "updateRateMs": 20 },
    { "name": "slowPoller", "updateRateMs": 500, "spreadRequests": true }
  ]
}"#;

const STRUCTS: &str = "\
# name, members...
Point,DINT,DINT
Line,Point,Point
Mixed,BOOL,LINT,\"ARRAY[0..2] OF Point\",\"ARRAY[1..3] OF BOOL\"
";

fn setup() -> (tempfile::TempDir, Arc<MockTransport>, Arc<EipDriver>) {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("driver.json"), CONFIG).unwrap();
    fs::write(dir.path().join("structs.csv"), STRUCTS).unwrap();

    let mock = Arc::new(MockTransport::new());
    let driver = EipDriver::from_config_file(&dir.path().join("driver.json"), mock.clone()).unwrap();
    (dir, mock, Arc::new(driver))
}

#[tokio::test]
async fn fixed_capacity_string_is_read_from_its_own_tag() {
    let (_dir, mock, driver) = setup();
    let mut memory = b"hello PLC".to_vec();
    memory.resize(100, 0);
    mock.set_memory("testString", memory);

    let id = driver
        .register_value("@testPoller testString STRING none none &str_max_capacity=100&optimise=1")
        .unwrap();
    let connection = driver.value_info(id).unwrap().connection;
    assert!(connection.starts_with("protocol=ab-eip&gateway=192.168.250.1&path=1,0&plc=omron-njnx"));
    assert!(connection.contains("&name=testString&elem_count=1"));
    assert!(connection.contains("str_max_capacity=100"));

    driver.run_optimisation_pass();
    let (results, stats) = driver.poll_group("testPoller").await.unwrap();
    assert_eq!(stats.ok, 1);
    assert_eq!(results[0].value, Some(DecodedValue::Text("hello PLC".to_string())));
    assert_eq!(results[0].value_display, "hello PLC");
}

#[tokio::test]
async fn sibling_fields_are_read_through_one_parent_tag() {
    let (_dir, mock, driver) = setup();
    let mut parent = Vec::new();
    parent.extend_from_slice(&11i32.to_le_bytes());
    parent.extend_from_slice(&22i32.to_le_bytes());
    mock.set_memory("parentA", parent);

    let x = driver.register_value("@testPoller parentA.fieldX DINT none 0 none").unwrap();
    let y = driver.register_value("@testPoller parentA.fieldY DINT none 4 none").unwrap();
    let report = driver.run_optimisation_pass();
    assert_eq!(report.groups_merged, 1);

    let info_x = driver.value_info(x).unwrap();
    let info_y = driver.value_info(y).unwrap();
    assert_eq!(info_x.state, OptimisationState::Master);
    assert_eq!(info_y.state, OptimisationState::Optimized);
    assert_eq!(info_x.handle, info_y.handle);

    let (results, _) = driver.poll_group("testPoller").await.unwrap();
    assert_eq!(mock.read_count("parentA"), 1);
    assert_eq!(results[0].value, Some(DecodedValue::Int32(11)));
    assert_eq!(results[1].value, Some(DecodedValue::Int32(22)));
}

#[tokio::test]
async fn array_elements_are_polled_through_one_slice() {
    let (_dir, mock, driver) = setup();
    let mut ids = Vec::new();
    for i in 1..=3 {
        mock.set_memory(&format!("psu[{i}]"), vec![0u8; 16]);
        for offset in [0, 4] {
            let text = format!("@testPoller psu[{i}] REAL none {offset} &optimise=1");
            ids.push(driver.register_value(&text).unwrap());
        }
    }
    let report = driver.run_optimisation_pass();
    assert_eq!(report.slices_merged, 1);
    assert_eq!(driver.value_info(ids[5]).unwrap().offset, 36);

    // 切片以 psu[1] 为起点读取 3 个元素
    let mut slice = vec![0u8; 48];
    for (n, offset) in [0usize, 4, 16, 20, 32, 36].into_iter().enumerate() {
        slice[offset..offset + 4].copy_from_slice(&(n as f32 + 0.5).to_le_bytes());
    }
    mock.set_memory("psu[1]", slice);

    let (_, stats) = driver.poll_group("testPoller").await.unwrap();
    assert_eq!(stats.ok, 6);
    assert_eq!(mock.read_count("psu[1]"), 1);
    assert_eq!(mock.read_count("psu[2]"), 0);
    for (n, id) in ids.iter().enumerate() {
        assert_eq!(driver.latest(*id).unwrap().value, Some(DecodedValue::Float32(n as f32 + 0.5)));
    }
}

#[tokio::test]
async fn struct_offsets_come_from_the_struct_file() {
    let (_dir, _mock, driver) = setup();
    let line = driver.register_value("line.end.y DINT none Line[2][2] none").unwrap();
    let lint = driver.register_value("mixed.big LINT none Mixed[2] none").unwrap();
    let flag = driver.register_value("mixed.flags BOOL none Mixed[4][2] none").unwrap();

    assert_eq!(driver.value_info(line).unwrap().offset, 12);
    assert_eq!(driver.value_info(lint).unwrap().offset, 8);
    assert_eq!(driver.value_info(flag).unwrap().offset, 321);
}

#[tokio::test]
async fn malformed_descriptors_are_rejected() {
    let (_dir, _mock, driver) = setup();
    assert!(matches!(driver.register_value(""), Err(DescriptorError::Empty)));
    assert!(driver.register_value("tag REAL none none").is_err());
    assert!(driver.register_value("@nope tag REAL none none none").is_err());
    assert!(driver.register_value(&format!("@{INIT_POLLER} tag REAL none none none")).is_err());
    assert!(driver.register_value("arr[1] STRING 2 none none").is_err());
    assert!(driver.register_value("t DINT none Ghost[1] none").is_err());
}

#[tokio::test]
async fn communication_failures_map_to_qualities() {
    let (_dir, _mock, driver) = setup();
    let missing = driver.register_value("@testPoller missingTag DINT none none none").unwrap();
    let slow = driver.register_value("@testPoller timeoutTag DINT none none none").unwrap();
    let broken = driver.register_value("@testPoller errorTag DINT none none none").unwrap();
    driver.run_optimisation_pass();

    driver.poll_group("testPoller").await.unwrap();
    assert_eq!(driver.latest(missing).unwrap().quality, Quality::CommError);
    assert_eq!(driver.latest(slow).unwrap().quality, Quality::Timeout);
    assert_eq!(driver.latest(broken).unwrap().quality, Quality::CommError);
}

#[tokio::test]
async fn background_polling_stops_within_a_second() {
    let (_dir, mock, driver) = setup();
    mock.set_memory("counter", 5i16.to_le_bytes().to_vec());
    let id = driver.register_value("@testPoller counter INT none none none").unwrap();

    driver.start();
    let deadline = Instant::now() + Duration::from_secs(2);
    while driver.latest(id).unwrap().quality != Quality::Ok {
        assert!(Instant::now() < deadline, "counter was never polled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    assert!(driver.stop().await);
    assert!(started.elapsed() < Duration::from_secs(1));

    let reads = mock.read_count("counter");
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(mock.read_count("counter"), reads);
}

#[tokio::test]
async fn write_then_read_back() {
    let (_dir, mock, driver) = setup();
    let id = driver.register_value("@testPoller setpoint REAL none none none").unwrap();
    driver.run_optimisation_pass();

    driver.write_value(id, DecodedValue::Float32(1.5)).await.unwrap();
    assert_eq!(&mock.memory("setpoint").unwrap()[..4], &1.5f32.to_le_bytes());

    driver.poll_group("testPoller").await.unwrap();
    assert_eq!(driver.latest(id).unwrap().value, Some(DecodedValue::Float32(1.5)));
}
