use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;
use url::Url;

use filewire_client::{ClientConfig, CompletionEvent, Handlers, ResourceClient, UserToken};
use filewire_core::{Error, MemoryResource, Method, Timeout};

fn memory_client(memory: &MemoryResource) -> ResourceClient {
    ResourceClient::with_resource(ClientConfig::default(), Arc::new(memory.clone())).unwrap()
}

fn mem_url(name: &str) -> Url {
    Url::parse(&format!("mem://ops/{}", name)).unwrap()
}

fn recv<T>(rx: &mpsc::Receiver<T>) -> T {
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

#[test]
fn test_upload_then_download_bytes() {
    let memory = MemoryResource::new();
    let client = memory_client(&memory);
    let url = mem_url("bytes");

    let echoed = client
        .upload_data(url.as_str(), Some(Method::PUT), b"0123456789")
        .unwrap();
    assert_eq!(echoed, b"0123456789");
    assert_eq!(client.download_data(url.as_str()).unwrap(), b"0123456789");

    let headers = client.response_headers().unwrap();
    assert_eq!(headers["content-length"], "10");
    assert_eq!(headers["content-type"], "application/octet-stream");
    assert_eq!(memory.open_streams(), 0);
    assert!(!client.is_busy());
}

#[test]
fn test_strings_strip_bom() {
    let memory = MemoryResource::new();
    let url = mem_url("text");
    memory.insert(&url, b"\xEF\xBB\xBFgr\xC3\xBC\xC3\x9F dich".to_vec());
    let client = memory_client(&memory);

    assert_eq!(client.download_string(url.as_str()).unwrap(), "grüß dich");
    assert_eq!(
        client.upload_string(url.as_str(), None, "replaced").unwrap(),
        "replaced"
    );
}

#[test]
fn test_file_transfer_round_trip() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("source.txt");
    let target = dir.path().join("target.txt");
    let copy = dir.path().join("copy.txt");
    std::fs::write(&source, b"file contents").unwrap();

    let client = ResourceClient::new(ClientConfig::default()).unwrap();
    let target_address = target.to_str().unwrap();
    client
        .upload_file(target_address, Some(Method::PUT), &source)
        .unwrap();
    let written = client.download_file(target_address, &copy).unwrap();

    assert_eq!(written, 13);
    assert_eq!(std::fs::read(&copy).unwrap(), b"file contents");
}

#[test]
fn test_base_address_resolution() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("note.txt"), b"relative").unwrap();
    let base = Url::from_directory_path(dir.path()).unwrap();

    let config = ClientConfig {
        base_address: Some(base),
        ..ClientConfig::default()
    };
    let client = ResourceClient::new(config).unwrap();
    assert_eq!(client.download_string("note.txt").unwrap(), "relative");
}

#[test]
fn test_missing_resource_is_transport_error() {
    let client = memory_client(&MemoryResource::new());
    let err = client.download_data(mem_url("absent").as_str()).unwrap_err();
    assert!(matches!(err, Error::Transport { .. }));
    assert!(!client.is_busy());
}

#[test]
fn test_open_read_and_open_write() {
    use std::io::{Read, Write};

    let memory = MemoryResource::new();
    let client = memory_client(&memory);
    let url = mem_url("streams");

    let mut writer = client.open_write(url.as_str(), None).unwrap();
    writer.write_all(b"streamed").unwrap();
    writer.close().unwrap();

    let mut reader = client.open_read(url.as_str()).unwrap();
    let mut text = String::new();
    reader.read_to_string(&mut text).unwrap();
    assert_eq!(text, "streamed");
}

#[test]
fn test_async_download_reports_progress_then_completes() {
    let memory = MemoryResource::new();
    let url = mem_url("async");
    memory.insert(&url, vec![7u8; 100_000]);
    let client = memory_client(&memory);

    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&progress);
    let (tx, rx) = mpsc::channel();
    client
        .download_data_async(
            url.as_str(),
            UserToken::new("download-1"),
            Handlers::new()
                .on_progress(move |event| {
                    seen.lock().unwrap().push((event.units_done, event.percentage));
                })
                .on_complete(move |event| tx.send(event).unwrap()),
        )
        .unwrap();

    let event: CompletionEvent<Vec<u8>> = recv(&rx);
    assert_eq!(event.result.unwrap().len(), 100_000);
    assert!(event.error.is_none());
    assert!(!event.cancelled);
    assert_eq!(event.token.get::<&str>(), Some(&"download-1"));

    let progress = progress.lock().unwrap();
    assert_eq!(progress.len(), 4);
    assert_eq!(progress.last(), Some(&(100_000, 100)));
    assert!(progress.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn test_async_upload_reports_each_chunk() {
    let memory = MemoryResource::new();
    let client = memory_client(&memory);
    let url = mem_url("chunks");

    let (progress_tx, progress_rx) = mpsc::channel();
    let (tx, rx) = mpsc::channel();
    client
        .upload_data_async(
            url.as_str(),
            None,
            vec![1u8; 10_000],
            UserToken::none(),
            Handlers::new()
                .on_progress(move |event| {
                    progress_tx.send(event.percentage).unwrap();
                })
                .on_complete(move |event| tx.send(event).unwrap()),
        )
        .unwrap();

    let event = recv(&rx);
    assert_eq!(event.result.unwrap().len(), 10_000);
    let percentages: Vec<u8> = progress_rx.try_iter().collect();
    assert_eq!(percentages, vec![40, 81, 100]);
}

#[test]
fn test_busy_client_rejects_second_operation() {
    let memory = MemoryResource::new();
    let url = mem_url("busy");
    memory.insert(&url, b"slow".to_vec());
    memory.set_open_delay(Some(Duration::from_millis(200)));
    let client = memory_client(&memory);

    let (tx, rx) = mpsc::channel();
    client
        .download_data_async(
            url.as_str(),
            UserToken::none(),
            Handlers::new().on_complete(move |event| tx.send(event).unwrap()),
        )
        .unwrap();
    assert!(client.is_busy());

    assert!(matches!(
        client.download_data(url.as_str()),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        client.download_string_async(url.as_str(), UserToken::none(), Handlers::new()),
        Err(Error::InvalidState { .. })
    ));

    let event = recv(&rx);
    assert_eq!(event.result.unwrap(), b"slow");
    assert!(!client.is_busy());
}

#[test]
fn test_cancel_async_interrupts_blocked_request() {
    let memory = MemoryResource::new();
    let url = mem_url("cancel");
    memory.insert(&url, b"never read".to_vec());
    memory.set_open_delay(Some(Duration::from_millis(500)));
    let config = ClientConfig {
        timeout: Timeout::Infinite,
        ..ClientConfig::default()
    };
    let client = ResourceClient::with_resource(config, Arc::new(memory.clone())).unwrap();

    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    client
        .download_data_async(
            url.as_str(),
            UserToken::none(),
            Handlers::new().on_complete(move |event| tx.send(event).unwrap()),
        )
        .unwrap();

    thread::sleep(Duration::from_millis(50));
    assert!(client.cancel_async());

    let event = recv(&rx);
    assert!(event.cancelled);
    assert!(event.result.is_none());
    assert!(event.error.is_none());
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!client.cancel_async());
}

#[test]
fn test_completion_handler_can_start_next_operation() {
    let memory = MemoryResource::new();
    let url = mem_url("chain");
    memory.insert(&url, b"first".to_vec());
    let client = Arc::new(memory_client(&memory));

    let (tx, rx) = mpsc::channel();
    let next = Arc::clone(&client);
    let next_url = url.clone();
    client
        .download_data_async(
            url.as_str(),
            UserToken::none(),
            Handlers::new().on_complete(move |_| {
                let started = next.download_data_async(
                    next_url.as_str(),
                    UserToken::none(),
                    Handlers::new().on_complete(move |event| tx.send(event).unwrap()),
                );
                assert!(started.is_ok());
            }),
        )
        .unwrap();

    assert_eq!(recv(&rx).result.unwrap(), b"first");
}

#[test]
fn test_async_open_write_then_open_read() {
    use std::io::{Read, Write};

    let memory = MemoryResource::new();
    let client = memory_client(&memory);
    let url = mem_url("opened");

    let (tx, rx) = mpsc::channel();
    client
        .open_write_async(
            url.as_str(),
            Some(Method::PUT),
            UserToken::new("writer"),
            Handlers::new().on_complete(move |event| tx.send(event).unwrap()),
        )
        .unwrap();
    let event = recv(&rx);
    assert_eq!(event.token.get::<&str>(), Some(&"writer"));
    let mut writer = event.result.unwrap();
    assert!(!client.is_busy());
    writer.write_all(b"opened async").unwrap();
    writer.close().unwrap();

    let (tx, rx) = mpsc::channel();
    client
        .open_read_async(
            url.as_str(),
            UserToken::none(),
            Handlers::new().on_complete(move |event| tx.send(event).unwrap()),
        )
        .unwrap();
    let mut reader = recv(&rx).result.unwrap();
    let mut text = String::new();
    reader.read_to_string(&mut text).unwrap();
    drop(reader);

    assert_eq!(text, "opened async");
    assert_eq!(client.response_headers().unwrap()["content-length"], "12");
    assert_eq!(memory.open_streams(), 0);
}

#[test]
fn test_cancel_async_interrupts_open_read() {
    let memory = MemoryResource::new();
    let url = mem_url("slow-open");
    memory.insert(&url, b"unused".to_vec());
    memory.set_open_delay(Some(Duration::from_millis(500)));
    let config = ClientConfig {
        timeout: Timeout::Infinite,
        ..ClientConfig::default()
    };
    let client = ResourceClient::with_resource(config, Arc::new(memory.clone())).unwrap();

    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    client
        .open_read_async(
            url.as_str(),
            UserToken::none(),
            Handlers::new().on_complete(move |event| tx.send(event).unwrap()),
        )
        .unwrap();

    thread::sleep(Duration::from_millis(50));
    assert!(client.cancel_async());

    let event = recv(&rx);
    assert!(event.cancelled);
    assert!(event.result.is_none());
    assert!(started.elapsed() < Duration::from_millis(500));
    wait_for_streams_closed(&memory);
}

fn wait_for_streams_closed(memory: &MemoryResource) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while memory.open_streams() > 0 {
        assert!(Instant::now() < deadline, "streams left open");
        thread::sleep(Duration::from_millis(5));
    }
}
