use chrono::Weekday;
use tokio::sync::mpsc;
use zebra_scent::*;

type TestController = Controller<ManualClock, SimulatedRegister, MemoryStore>;

fn controller() -> (TestController, ManualClock) {
    let clock = ManualClock::default();
    let controller = Controller::new(
        clock.clone(),
        SimulatedRegister::new(),
        MemoryStore::new(),
        SharedLink::default(),
    );
    (controller, clock)
}

fn at(clock: &ManualClock, minute: u32, day: Weekday) {
    clock.set(MinuteOfDay::new(minute).unwrap(), day);
}

fn rule(ch: u8, s: u32, e: u32, d: Days) -> RuleRecord {
    RuleRecord {
        en: true,
        ch,
        s,
        e,
        d: d.bits(),
    }
}

#[test]
fn test_single_window_on_then_off() {
    let (mut c, clock) = controller();
    c.replace_rules(&[rule(3, 480, 540, Days::ALL)]).unwrap();

    at(&clock, 500, Weekday::Wed);
    assert_eq!(c.tick().bits(), 0b0000_0100);
    assert_eq!(c.driver().pins().outputs(), Some(0b0000_0100));

    at(&clock, 540, Weekday::Wed);
    assert_eq!(c.tick(), OutputMask::ALL_OFF);
    assert_eq!(c.driver().pins().outputs(), Some(0));
}

#[test]
fn test_wrapping_window_belongs_to_start_day() {
    let (mut c, clock) = controller();
    c.replace_rules(&[rule(5, 1380, 60, Days::MONDAY)]).unwrap();

    at(&clock, 1400, Weekday::Mon);
    assert_eq!(c.tick().bits(), 0b0001_0000);

    at(&clock, 30, Weekday::Tue);
    assert_eq!(c.tick().bits(), 0b0001_0000);

    at(&clock, 30, Weekday::Mon);
    assert_eq!(c.tick(), OutputMask::ALL_OFF);

    // Sunday night into Monday morning needs the Sunday bit
    at(&clock, 30, Weekday::Mon);
    c.replace_rules(&[rule(5, 1380, 60, Days::SUNDAY)]).unwrap();
    assert_eq!(c.applied().bits(), 0b0001_0000);
}

#[test]
fn test_overlapping_rules_do_not_double_count() {
    let (mut both, clock_a) = controller();
    let (mut one, clock_b) = controller();
    both.replace_rules(&[
        rule(2, 600, 700, Days::ALL),
        rule(2, 650, 800, Days::ALL),
    ])
    .unwrap();
    one.replace_rules(&[rule(2, 600, 700, Days::ALL)]).unwrap();

    at(&clock_a, 660, Weekday::Fri);
    at(&clock_b, 660, Weekday::Fri);
    assert_eq!(both.tick(), one.tick());
}

#[test]
fn test_empty_window_never_turns_on() {
    let (mut c, clock) = controller();
    c.replace_rules(&[rule(1, 300, 300, Days::ALL)]).unwrap();
    for minute in [0, 299, 300, 301, 1439] {
        at(&clock, minute, Weekday::Sat);
        assert_eq!(c.tick(), OutputMask::ALL_OFF, "minute {minute}");
    }
}

#[test]
fn test_unsynchronized_clock_is_all_off() {
    let (mut c, clock) = controller();
    c.replace_rules(&[rule(1, 0, 1439, Days::ALL)]).unwrap();
    at(&clock, 100, Weekday::Mon);
    assert_eq!(c.tick().bits(), 0x01);

    clock.set_synchronized(false);
    assert_eq!(c.tick(), OutputMask::ALL_OFF);
    assert!(!c.state().time_ok);
}

#[test]
fn test_override_holds_until_schedule_edge() {
    let (mut c, clock) = controller();
    c.replace_rules(&[rule(1, 480, 540, Days::ALL)]).unwrap();

    at(&clock, 500, Weekday::Thu);
    assert_eq!(c.tick().bits(), 0x01);

    // Off by hand while the schedule still says on
    c.set_channel(1, false).unwrap();
    assert_eq!(c.applied(), OutputMask::ALL_OFF);
    for minute in [501, 520, 539] {
        at(&clock, minute, Weekday::Thu);
        assert_eq!(c.tick(), OutputMask::ALL_OFF, "released early at {minute}");
    }

    // The schedule's own ON -> OFF edge hands the channel back
    at(&clock, 540, Weekday::Thu);
    assert_eq!(c.tick(), OutputMask::ALL_OFF);
    assert!(!c.arbiter().state(Channel::FIRST).override_active);

    // Next window runs normally
    at(&clock, 480, Weekday::Fri);
    assert_eq!(c.tick().bits(), 0x01);
}

#[test]
fn test_manual_on_released_when_window_starts_and_ends() {
    let (mut c, clock) = controller();
    c.replace_rules(&[rule(4, 600, 660, Days::ALL)]).unwrap();
    at(&clock, 500, Weekday::Sun);
    c.tick();

    c.set_channel(4, true).unwrap();
    assert_eq!(c.applied().bits(), 0b0000_1000);

    // Schedule OFF -> ON edge releases the override; the channel stays on
    at(&clock, 600, Weekday::Sun);
    assert_eq!(c.tick().bits(), 0b0000_1000);
    assert_eq!(c.arbiter().active_overrides(), 0);

    at(&clock, 660, Weekday::Sun);
    assert_eq!(c.tick(), OutputMask::ALL_OFF);
}

#[test]
fn test_set_all() {
    let (mut c, _) = controller();
    assert_eq!(c.set_channel(0, true).unwrap(), OutputMask::ALL_ON);
    assert!(c.state().all_on);
    assert_eq!(c.set_channel(0, false).unwrap(), OutputMask::ALL_OFF);
    assert!(!c.state().any_on);
}

#[test]
fn test_repeated_command_writes_once() {
    let (mut c, _) = controller();
    let (tx, mut rx) = mpsc::unbounded_channel();
    c.subscribe(tx);

    c.set_channel(6, true).unwrap();
    c.set_channel(6, true).unwrap();
    c.tick();
    assert_eq!(c.driver().write_count(), 2);

    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    assert_eq!(events.len(), 2);
    assert_eq!(events[1], Notification::Aggregate(Aggregate::Mixed));
}

#[test]
fn test_seventeenth_rule_is_refused() {
    let (mut c, _) = controller();
    let records = vec![rule(1, 0, 10, Days::ALL); MAX_RULES + 1];
    let err = c.replace_rules(&records).unwrap_err();
    assert!(matches!(err, Error::Capacity { what: "rules", limit: MAX_RULES }));
    assert_eq!(c.rules().enabled_count(), 0);

    c.replace_rules(&records[..MAX_RULES]).unwrap();
    assert_eq!(c.rules().enabled_count(), MAX_RULES);
}

#[test]
fn test_invalid_rule_reports_index_and_reason() {
    let (mut c, _) = controller();
    let err = c
        .replace_rules(&[rule(1, 0, 10, Days::ALL), rule(2, 0, 1440, Days::ALL)])
        .unwrap_err();
    match err {
        Error::InvalidRule { index, reason } => {
            assert_eq!(index, 1);
            assert_eq!(reason, RuleError::MinuteOutOfRange(1440));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_register_sees_only_final_masks() {
    let (mut c, clock) = controller();
    c.replace_rules(&[
        rule(1, 0, 1439, Days::ALL),
        rule(8, 0, 1439, Days::ALL),
    ])
    .unwrap();
    at(&clock, 10, Weekday::Mon);
    c.tick();
    assert_eq!(c.driver().pins().visible_history(), &[0x00, 0x81]);
}
