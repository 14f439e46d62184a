use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rvoip_dispatcher_core::registry::{DestinationRow, DestinationSource, ListFileSource, StaticResolver, StaticSource};
use rvoip_dispatcher_core::{
    Algorithm, BasicMessage, DestinationState, Dispatcher, DispatcherConfig, DispatcherError, NoopEventRouter, Result,
    UpdateMode,
};

fn dispatcher(config: DispatcherConfig) -> Result<Dispatcher> {
    Dispatcher::with_resolver(config, Arc::new(NoopEventRouter), Arc::new(StaticResolver::new()))
}

fn generation_rows(prefix: &str) -> Vec<DestinationRow> {
    (1..=4)
        .map(|i| DestinationRow::new(1, format!("sip:{}.{}", prefix, i)))
        .collect()
}

#[test]
fn test_list_file_load() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(
        file,
        "# gateways\n\
         1 sip:10.0.0.3:5060 0 5 duid=c;maxload=10\n\
         1 10.0.0.1 8 0\n\
         \n\
         1 sip:10.0.0.2 1\n\
         2 sip:[2001:db8::1]:5060;transport=tcp\n\
         x sip:10.0.0.9\n\
         2 sip:bad host\n"
    )?;

    let dispatcher = dispatcher(DispatcherConfig {
        list_file: Some(file.path().to_path_buf()),
        ..Default::default()
    })?;
    let report = dispatcher.reload_list_file()?;
    assert_eq!(report.destinations, 4);
    assert_eq!(report.sets, 2);
    assert!(report.is_partial());

    let generation = dispatcher.registry().snapshot();
    let set = generation.lookup(1).unwrap();
    let uris: Vec<&str> = set.destinations().iter().map(|d| d.uri.as_str()).collect();
    // the scheme-less URI is repaired, ties keep file order
    assert_eq!(uris, vec!["sip:10.0.0.1", "sip:10.0.0.2", "sip:10.0.0.3:5060"]);
    assert!(set.get(0).unwrap().health().probing);
    assert_eq!(set.get(1).unwrap().health().state, DestinationState::Inactive);
    assert_eq!(set.get(2).unwrap().attrs.maxload, 10);
    Ok(())
}

#[test]
fn test_ipv6_rows_skipped_when_disabled() -> Result<()> {
    let dispatcher = dispatcher(DispatcherConfig {
        try_ipv6: false,
        ..Default::default()
    })?;
    let report = dispatcher.reload(&mut StaticSource::new(vec![
        DestinationRow::new(1, "sip:10.0.0.1"),
        DestinationRow::new(1, "sip:[2001:db8::1]"),
    ]))?;
    assert_eq!(report.destinations, 1);
    assert_eq!(report.skipped_ipv6, 1);
    Ok(())
}

#[test]
fn test_failed_reload_keeps_serving() -> Result<()> {
    let dispatcher = dispatcher(DispatcherConfig::default())?;
    dispatcher.reload(&mut StaticSource::new(generation_rows("10.0.0")))?;
    let before = dispatcher.registry().snapshot().version();

    let mut missing = ListFileSource::new("/nonexistent/dispatcher.list");
    assert!(matches!(dispatcher.reload(&mut missing), Err(DispatcherError::Io(_))));

    assert_eq!(dispatcher.registry().snapshot().version(), before);
    let mut msg = BasicMessage::request("INVITE", "sip:x@example.com");
    dispatcher.select(&mut msg, 1, Algorithm::Serial, UpdateMode::DestinationUri)?;
    assert_eq!(msg.destination_uri.as_deref(), Some("sip:10.0.0.1"));
    Ok(())
}

/// Source that reports one schema version and fills only its columns
struct NarrowSource(Vec<DestinationRow>);

impl DestinationSource for NarrowSource {
    fn schema_version(&self) -> rvoip_dispatcher_core::registry::SchemaVersion {
        rvoip_dispatcher_core::registry::SchemaVersion::V2
    }

    fn load_rows(&mut self) -> Result<Vec<Result<DestinationRow>>> {
        Ok(self.0.drain(..).map(Ok).collect())
    }
}

#[test]
fn test_custom_source() -> Result<()> {
    let dispatcher = dispatcher(DispatcherConfig::default())?;
    let report = dispatcher.reload(&mut NarrowSource(vec![
        DestinationRow::new(3, "sip:10.0.0.1").with_flags(4),
        DestinationRow::new(3, "sip:10.0.0.2"),
    ]))?;
    assert_eq!(report.destinations, 2);
    let generation = dispatcher.registry().snapshot();
    assert_eq!(
        generation.lookup(3).unwrap().get(0).unwrap().health().state,
        DestinationState::Disabled
    );
    Ok(())
}

#[test]
fn test_selections_never_mix_generations() -> Result<()> {
    let dispatcher = Arc::new(dispatcher(DispatcherConfig {
        failover: true,
        ..Default::default()
    })?);
    dispatcher.reload(&mut StaticSource::new(generation_rows("10.1.0")))?;
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|t| {
            let dispatcher = Arc::clone(&dispatcher);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut checked = 0usize;
                while !done.load(Ordering::Acquire) || checked == 0 {
                    let mut msg = BasicMessage::request("INVITE", "sip:x@example.com")
                        .with_call_id(format!("{}-{}", t, checked));
                    let selection = dispatcher
                        .select(&mut msg, 1, Algorithm::HashCallId, UpdateMode::DestinationUri)
                        .expect("selection");
                    let prefix = &selection.uri[..selection.uri.rfind('.').unwrap()];
                    assert_eq!(selection.alternates, 3);
                    for entry in msg.state.failover.iter() {
                        assert!(entry.uri.starts_with(prefix), "{} mixed with {}", entry.uri, selection.uri);
                    }
                    checked += 1;
                }
                checked
            })
        })
        .collect();

    for round in 0..50 {
        let prefix = if round % 2 == 0 { "10.2.0" } else { "10.1.0" };
        dispatcher.reload(&mut StaticSource::new(generation_rows(prefix)))?;
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        assert!(reader.join().expect("reader thread") > 0);
    }
    Ok(())
}
