/// Gebug command categories.
///
/// The category byte groups commands by the game subsystem they touch.
/// Codes the link does not know are carried as [`Category::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Meta,
    Misc,
    Memory,
    Stage,
    Chr,
    Objects,
    File,
    Video,
    Cheat,
    Debug,
    Replay,
    Other(u8),
}

impl Category {
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            10 => Self::Meta,
            15 => Self::Misc,
            20 => Self::Memory,
            25 => Self::Stage,
            30 => Self::Chr,
            35 => Self::Objects,
            40 => Self::File,
            45 => Self::Video,
            50 => Self::Cheat,
            55 => Self::Debug,
            60 => Self::Replay,
            other => Self::Other(other),
        }
    }

    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Meta => 10,
            Self::Misc => 15,
            Self::Memory => 20,
            Self::Stage => 25,
            Self::Chr => 30,
            Self::Objects => 35,
            Self::File => 40,
            Self::Video => 45,
            Self::Cheat => 50,
            Self::Debug => 55,
            Self::Replay => 60,
            Self::Other(byte) => byte,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Meta => "meta",
            Self::Misc => "misc",
            Self::Memory => "memory",
            Self::Stage => "stage",
            Self::Chr => "chr",
            Self::Objects => "objects",
            Self::File => "file",
            Self::Video => "video",
            Self::Cheat => "cheat",
            Self::Debug => "debug",
            Self::Replay => "replay",
            Self::Other(_) => "other",
        }
    }
}

impl From<u8> for Category {
    fn from(byte: u8) -> Self {
        Self::from_byte(byte)
    }
}

impl From<Category> for u8 {
    fn from(category: Category) -> Self {
        category.as_byte()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes() {
        assert_eq!(Category::from_byte(10), Category::Meta);
        assert_eq!(Category::from_byte(45), Category::Video);
        assert_eq!(Category::Replay.as_byte(), 60);
    }

    #[test]
    fn test_every_byte_maps_back() {
        for byte in 0..=u8::MAX {
            assert_eq!(Category::from_byte(byte).as_byte(), byte);
        }
    }

    #[test]
    fn test_unknown_code_is_other() {
        assert_eq!(Category::from_byte(11), Category::Other(11));
        assert_eq!(Category::Other(11).name(), "other");
    }
}
