//! PX4 packs its flight mode into the HEARTBEAT custom-mode word: main
//! mode in bits 16..24, sub mode in bits 24..32.

const MAIN_MODES: [(u32, &str); 8] = [
    (1, "MANUAL"),
    (2, "ALTCTL"),
    (3, "POSCTL"),
    (4, "AUTO"),
    (5, "ACRO"),
    (6, "OFFBOARD"),
    (7, "STABILIZED"),
    (8, "RATTITUDE"),
];

const AUTO_SUB_MODES: [(u32, &str); 7] = [
    (1, "AUTO.READY"),
    (2, "AUTO.TAKEOFF"),
    (3, "AUTO.LOITER"),
    (4, "AUTO.MISSION"),
    (5, "AUTO.RTL"),
    (6, "AUTO.LAND"),
    (8, "AUTO.FOLLOW_TARGET"),
];

/// Readable mode name for a heartbeat custom-mode word.
pub fn mode_name(custom_mode: u32) -> String {
    let main = (custom_mode >> 16) & 0xff;
    let sub = (custom_mode >> 24) & 0xff;

    if main == 4 {
        if let Some((_, name)) = AUTO_SUB_MODES.iter().find(|(id, _)| *id == sub) {
            return (*name).to_owned();
        }
    }
    match MAIN_MODES.iter().find(|(id, _)| *id == main) {
        Some((_, name)) => (*name).to_owned(),
        None => format!("CMODE({})", custom_mode),
    }
}

/// Custom-mode word for a mode name, if the name is known.
pub fn custom_mode(name: &str) -> Option<u32> {
    if let Some((sub, _)) = AUTO_SUB_MODES.iter().find(|(_, n)| *n == name) {
        return Some(encode(4, *sub));
    }
    MAIN_MODES
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(main, _)| encode(*main, 0))
}

fn encode(main: u32, sub: u32) -> u32 {
    (main << 16) | (sub << 24)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_modes_round_trip() {
        for name in ["MANUAL", "POSCTL", "OFFBOARD", "AUTO.LAND", "AUTO.RTL"] {
            let word = custom_mode(name).unwrap();
            assert_eq!(mode_name(word), name);
        }
    }

    #[test]
    fn unknown_word_is_still_printable() {
        assert_eq!(mode_name(0), "CMODE(0)");
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(custom_mode("WARP_SPEED").is_none());
    }
}
