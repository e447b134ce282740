use std::sync::{Arc, Mutex};

#[allow(unused)]
pub fn change_watcher<T: Send + Sync + 'static>() -> (Arc<dyn Fn(T) + Send + Sync>, Box<dyn Fn() -> Vec<T> + Send + Sync>) {
    let changes = Arc::new(Mutex::new(Vec::new()));
    let watcher = {
        let changes = changes.clone();
        Arc::new(move |value: T| {
            changes.lock().unwrap().push(value);
        })
    };

    let check = Box::new(move || {
        let changes: Vec<T> = changes.lock().unwrap().drain(..).collect();
        changes
    });

    (watcher, check)
}

/// Counts `on_change` calls from a bridge
#[allow(unused)]
pub fn notify_counter() -> (impl Fn() + Send + Sync + 'static, Box<dyn Fn() -> usize + Send + Sync>) {
    let count = Arc::new(Mutex::new(0usize));
    let notify = {
        let count = count.clone();
        move || *count.lock().unwrap() += 1
    };
    (notify, Box::new(move || *count.lock().unwrap()))
}

#[allow(unused)]
pub fn init_tracing() { let _ = tracing_subscriber::fmt().with_test_writer().try_init(); }
