use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tgflow_scroll::{Controller, ScrollConfig};
use tokio::sync::oneshot;

fn paged_controller() -> Controller<u32> {
    let mut controller = Controller::new(ScrollConfig {
        container_height: 100.0,
        item_height: 10.0,
        buffer_size: 0,
        infinite_scroll: true,
        load_more_threshold: 50.0,
        ..ScrollConfig::default()
    })
    .unwrap();
    controller.set_items(0..20, false);
    controller
}

#[test]
fn loads_trigger_near_the_bottom_one_at_a_time() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut controller = paged_controller();
    controller.set_load_more_callback(move || {
        let page = counter.fetch_add(1, Ordering::SeqCst) as u32;
        async move {
            if page == 0 {
                (20..30).collect::<Vec<u32>>()
            } else {
                Vec::new()
            }
        }
    });

    // 0 + 100 < 200 - 50
    assert!(!controller.handle_scroll(0.0).load_more_started);
    assert!(controller.handle_scroll(60.0).load_more_started);
    assert!(controller.state().is_loading_more);
    assert!(!controller.handle_scroll(70.0).load_more_started);
    assert!(!controller.handle_scroll(100.0).load_more_started);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(controller.poll_load_more(), Some(10));
    let state = controller.state();
    assert_eq!(state.item_count, 30);
    assert_eq!(state.total_height, 300.0);
    assert!(state.has_more);
    assert!(!state.is_loading_more);

    // An empty page marks the list as exhausted.
    assert!(controller.handle_scroll(200.0).load_more_started);
    assert_eq!(controller.poll_load_more(), Some(0));
    assert!(!controller.state().has_more);
    assert!(!controller.handle_scroll(200.0).load_more_started);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn nothing_triggers_without_a_callback_or_when_disabled() {
    let mut controller = paged_controller();
    assert!(!controller.handle_scroll(150.0).load_more_started);

    let mut controller = Controller::<u32>::new(ScrollConfig {
        infinite_scroll: false,
        ..ScrollConfig::default()
    })
    .unwrap();
    controller.set_items(0..5, false);
    controller.set_load_more_callback(|| async { vec![99] });
    assert!(!controller.handle_scroll(1_000.0).load_more_started);
    assert_eq!(controller.poll_load_more(), None);
}

#[test]
fn unresolved_loads_keep_the_flag_set() {
    let (tx, rx) = oneshot::channel::<Vec<u32>>();
    let rx = Arc::new(Mutex::new(Some(rx)));
    let mut controller = paged_controller();
    controller.set_load_more_callback(move || {
        let rx = rx.lock().unwrap().take();
        async move {
            match rx {
                Some(rx) => rx.await.unwrap_or_default(),
                None => Vec::new(),
            }
        }
    });

    assert!(controller.handle_scroll(150.0).load_more_started);
    assert_eq!(controller.poll_load_more(), None);
    assert!(controller.state().is_loading_more);

    tx.send(vec![20, 21]).unwrap();
    assert_eq!(controller.poll_load_more(), Some(2));
    assert_eq!(controller.items().last(), Some(&21));
}

#[test]
fn replacing_the_list_drops_an_in_flight_load() {
    let mut controller = paged_controller();
    controller.set_load_more_callback(|| async { vec![1_000] });
    assert!(controller.handle_scroll(150.0).load_more_started);

    controller.set_items(0..3, false);
    assert!(!controller.state().is_loading_more);
    assert_eq!(controller.poll_load_more(), None);
    assert_eq!(controller.items(), &[0, 1, 2]);
}

#[tokio::test]
async fn finish_load_more_awaits_the_pending_page() {
    let (tx, rx) = oneshot::channel::<Vec<u32>>();
    let rx = Arc::new(Mutex::new(Some(rx)));
    let mut controller = paged_controller();
    controller.set_load_more_callback(move || {
        let rx = rx.lock().unwrap().take();
        async move {
            match rx {
                Some(rx) => rx.await.unwrap_or_default(),
                None => Vec::new(),
            }
        }
    });

    assert_eq!(controller.finish_load_more().await, None);
    assert!(controller.handle_scroll(150.0).load_more_started);
    tokio::spawn(async move {
        let _ = tx.send((20..25).collect());
    });
    assert_eq!(controller.finish_load_more().await, Some(5));
    assert_eq!(controller.len(), 25);
    assert!(controller.state().has_more);
}
