use super::*;
use std::os::raw::c_void;

#[repr(C)]
struct FakeObject {
    refcount: u32,
}

unsafe extern "C" fn fake_ref(ptr: *mut c_void) -> *mut c_void {
    (*(ptr as *mut FakeObject)).refcount += 1;
    ptr
}

unsafe extern "C" fn fake_unref(ptr: *mut c_void) {
    (*(ptr as *mut FakeObject)).refcount -= 1;
}

fn fake_object() -> (usize, Box<FakeObject>) {
    let mut object = Box::new(FakeObject { refcount: 1 });
    let address = &mut *object as *mut FakeObject as usize;
    (address, object)
}

fn refcount(address: usize) -> u32 {
    unsafe { (*(address as *const FakeObject)).refcount }
}

fn tracker() -> ObjectTracker {
    ObjectTracker::new(Some(RefcountFns::new(fake_ref, fake_unref)))
}

#[test]
fn test_c_prefix() {
    assert_eq!(c_prefix("GdkRGBA"), "gdk_rgba");
    assert_eq!(c_prefix("GError"), "g_error");
    assert_eq!(c_prefix("GtkTextIter"), "gtk_text_iter");
    assert_eq!(c_prefix("PangoFontDescription"), "pango_font_description");
    assert_eq!(c_prefix("GVariant"), "g_variant");
    assert_eq!(c_prefix("Gsk3DRenderer"), "gsk3_d_renderer");
}

#[test]
fn test_borrowed_retrievals_keep_refcount() {
    let (address, _object) = fake_object();
    let tracker = tracker();
    let config = EngineConfig::default();

    let mut wrappers = Vec::new();
    for _ in 0..5 {
        wrappers.push(tracker.wrap_object(&config, address, Ownership::Borrowed).unwrap());
    }
    assert_eq!(refcount(address), 1);
    assert!(wrappers.windows(2).all(|w| w[0] == w[1]));

    drop(wrappers);
    assert_eq!(refcount(address), 1);
}

#[test]
fn test_owned_retrievals_released_on_drop() {
    let (address, _object) = fake_object();
    let tracker = tracker();
    let config = EngineConfig::default();

    let mut wrappers = Vec::new();
    for _ in 0..3 {
        // native transfers a reference with each owned result
        unsafe { fake_ref(address as *mut c_void) };
        wrappers.push(tracker.wrap_object(&config, address, Ownership::Owned).unwrap());
    }
    assert_eq!(refcount(address), 4);
    assert_eq!(wrappers[0].as_object().unwrap().held_references(), 3);

    drop(wrappers);
    assert_eq!(refcount(address), 1);
}

#[test]
fn test_acquire_on_borrowed_wrapper() {
    let (address, _object) = fake_object();
    let tracker = tracker();
    let config = EngineConfig::default();

    let value = tracker.wrap_object(&config, address, Ownership::Borrowed).unwrap();
    let handle = value.as_object().unwrap().clone();
    assert!(!handle.is_owned());

    handle.acquire();
    assert_eq!(refcount(address), 2);
    assert!(handle.is_owned());

    drop(value);
    assert_eq!(refcount(address), 2);
    drop(handle);
    assert_eq!(refcount(address), 1);
}

#[test]
fn test_identity_cache_is_weak() {
    let (address, _object) = fake_object();
    let tracker = tracker();
    let config = EngineConfig::default();

    let before = live_wrappers();
    let first = tracker.wrap_object(&config, address, Ownership::Borrowed).unwrap();
    assert_eq!(live_wrappers(), before + 1);
    drop(first);
    assert_eq!(live_wrappers(), before);

    assert!(cache::lookup(address).is_none());
    let second = tracker.wrap_object(&config, address, Ownership::Borrowed).unwrap();
    assert_eq!(second.as_object().unwrap().address(), address);
}

#[test]
fn test_object_argument_transfer() {
    let (address, _object) = fake_object();
    let tracker = tracker();
    let config = EngineConfig::default();

    let value = tracker.wrap_object(&config, address, Ownership::Borrowed).unwrap();
    let passed = tracker
        .object_argument(&config, &value, Ownership::Borrowed, false)
        .unwrap();
    assert_eq!(passed, address);
    assert_eq!(refcount(address), 1);

    tracker
        .object_argument(&config, &value, Ownership::Owned, false)
        .unwrap();
    assert_eq!(refcount(address), 2);
    unsafe { fake_unref(address as *mut c_void) };
}

#[test]
fn test_null_object_argument() {
    let tracker = tracker();
    let config = EngineConfig::default();

    assert_eq!(
        tracker
            .object_argument(&config, &Value::Null, Ownership::Borrowed, true)
            .unwrap(),
        0
    );
    let err = tracker
        .object_argument(&config, &Value::Null, Ownership::Borrowed, false)
        .unwrap_err();
    assert!(err.is_marshal());

    assert_eq!(
        tracker.wrap_object(&config, 0, Ownership::Owned).unwrap(),
        Value::Null
    );
}

#[test]
fn test_refcount_traffic_counts() {
    reset_traffic();
    let (address, _object) = fake_object();
    let tracker = tracker();
    let config = EngineConfig::default();

    let value = tracker.wrap_object(&config, address, Ownership::Borrowed).unwrap();
    value.as_object().unwrap().acquire();
    drop(value);
    assert_eq!(refcount_traffic(), (1, 1));
}

#[test]
fn test_borrowed_boxed_never_freed() {
    let config = EngineConfig::default();
    let mut data = [0u8; 16];
    let value = wrap_boxed(
        &config,
        data.as_mut_ptr() as usize,
        "NbTestRect",
        "libno-such-library",
        Ownership::Borrowed,
    );
    let boxed = value.as_boxed().unwrap();
    assert!(!boxed.is_owned());
    assert_eq!(boxed.type_name(), "NbTestRect");
    assert_ne!(value, wrap_boxed(&config, data.as_mut_ptr() as usize, "NbTestRect", "x", Ownership::Borrowed));
}
