use std::ffi::c_void;
use std::hint::black_box;
use std::ptr;

use fiberglass::*;

struct Shared {
    main: FiberRef,
    counter: u64,
    seen: Vec<f64>,
}

fn shared(main: FiberRef) -> Box<Shared> {
    Box::new(Shared {
        main,
        counter: 0,
        seen: Vec::new(),
    })
}

extern "C" fn count_forever(arg: *mut c_void) {
    let shared = arg as *mut Shared;
    unsafe {
        loop {
            (*shared).counter += 1;
            switch_to((*shared).main);
        }
    }
}

#[test]
fn locals_survive_round_trip() {
    extern "C" fn accumulate(arg: *mut c_void) {
        let shared = arg as *mut Shared;
        // Floats live in callee-saved vector registers on some targets.
        let mut x = black_box(0.5f64);
        unsafe {
            for _ in 0..3 {
                x *= 2.0;
                (*shared).seen.push(x);
                switch_to((*shared).main);
            }
            switch_to((*shared).main);
        }
    }

    let main = adopt_thread();
    let mut shared = shared(main);
    let arg = &mut *shared as *mut Shared as *mut c_void;
    let mut fiber = new_fiber(accumulate, arg, Attributes::new()).unwrap();

    let a = black_box(0x1234_5678u64);
    let b = black_box([7u8; 64]);
    let c = black_box(1.25f64);
    unsafe {
        for _ in 0..4 {
            switch_to(fiber.handle());
        }
    }
    assert_eq!(a, 0x1234_5678);
    assert_eq!(b, [7u8; 64]);
    assert_eq!(c, 1.25);
    assert_eq!(shared.seen, vec![1.0, 2.0, 4.0]);

    fiber.release_stack();
}

#[test]
fn ping_pong_thousand_times() {
    let main = adopt_thread();
    let mut shared = shared(main);
    let arg = &mut *shared as *mut Shared as *mut c_void;
    let mut fiber = new_fiber(count_forever, arg, Attributes::new()).unwrap();

    for _ in 0..1000 {
        unsafe { switch_to(fiber.handle()) };
    }
    assert_eq!(shared.counter, 1000);

    fiber.release_stack();
    assert!(fiber.is_released());
}

#[test]
fn unchecked_switch_matches_checked() {
    let main = adopt_thread();
    let mut shared = shared(main);
    let arg = &mut *shared as *mut Shared as *mut c_void;
    let mut fiber = new_fiber(count_forever, arg, Attributes::new()).unwrap();

    unsafe {
        switch_to_unchecked(fiber.handle());
        switch_to(fiber.handle());
        switch_to_unchecked(fiber.handle());
    }
    assert_eq!(shared.counter, 3);
    fiber.release_stack();
}

#[test]
fn default_size_fiber() {
    let fiber = new_fiber(count_forever, ptr::null_mut(), Attributes::new()).unwrap();
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let rounded = (DEFAULT_STACK_SIZE + page - 1) & !(page - 1);
    assert_eq!(fiber.stack_size(), rounded);
    assert_eq!(fiber.stack_floor() as usize - fiber.stack_ceiling() as usize, rounded);
}

#[test]
fn adopt_thread_is_idempotent() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("fiberglass=debug")
        .with_test_writer()
        .try_init();

    assert!(!is_adopted());
    let first = adopt_thread();
    let second = adopt_thread();
    assert_eq!(first, second);
    assert_eq!(current(), first);
    assert!(unsafe { first.get() }.is_native());
}

#[test]
fn current_and_previous_follow_switches() {
    struct Observed {
        main: FiberRef,
        current: Option<FiberRef>,
        previous: Option<FiberRef>,
    }

    extern "C" fn observe(arg: *mut c_void) {
        let observed = arg as *mut Observed;
        unsafe {
            (*observed).current = Some(current());
            (*observed).previous = previous();
            switch_to((*observed).main);
        }
    }

    let main = adopt_thread();
    assert_eq!(previous(), None);

    let mut observed = Box::new(Observed {
        main,
        current: None,
        previous: None,
    });
    let arg = &mut *observed as *mut Observed as *mut c_void;
    let mut fiber = new_fiber(observe, arg, Attributes::new()).unwrap();
    unsafe { switch_to(fiber.handle()) };

    assert_eq!(observed.current, Some(fiber.handle()));
    assert_eq!(observed.previous, Some(main));
    assert_eq!(current(), main);
    assert_eq!(previous(), Some(fiber.handle()));

    // Switching to the running context changes nothing.
    unsafe { switch_to(main) };
    assert_eq!(previous(), Some(fiber.handle()));

    fiber.release_stack();
}

#[test]
fn fibers_switch_between_each_other() {
    struct Chain {
        main: FiberRef,
        next: Option<FiberRef>,
        order: Vec<&'static str>,
    }

    extern "C" fn first(arg: *mut c_void) {
        let chain = arg as *mut Chain;
        unsafe {
            (*chain).order.push("first");
            switch_to((*chain).next.unwrap());
            (*chain).order.push("first again");
            switch_to((*chain).main);
        }
    }

    extern "C" fn second(arg: *mut c_void) {
        let chain = arg as *mut Chain;
        unsafe {
            (*chain).order.push("second");
            // Back to whoever switched to us.
            switch_to(previous().unwrap());
        }
    }

    let main = adopt_thread();
    let mut chain = Box::new(Chain {
        main,
        next: None,
        order: Vec::new(),
    });
    let arg = &mut *chain as *mut Chain as *mut c_void;
    let mut a = new_fiber(first, arg, Attributes::new()).unwrap();
    let mut b = new_fiber(second, arg, Attributes::new().stack_size(128 * 1024)).unwrap();
    chain.next = Some(b.handle());

    unsafe { switch_to(a.handle()) };
    assert_eq!(chain.order, ["first", "second", "first again"]);

    a.release_stack();
    b.release_stack();
}

#[test]
fn executable_stack_runs() {
    let main = adopt_thread();
    let mut shared = shared(main);
    let attributes = Attributes::new().flags(Flags::EXECUTABLE);
    let arg = &mut *shared as *mut Shared as *mut c_void;
    let mut fiber = new_fiber(count_forever, arg, attributes).unwrap();
    unsafe { switch_to(fiber.handle()) };
    assert_eq!(shared.counter, 1);
    fiber.release_stack();
}
