//! The PEG virtual machine's opcode table.
//!
//! The integer values are a compatibility boundary: the same numbering is
//! shared with the host VM and the code generator, so every other module
//! reads it from here instead of inventing its own.

use core::fmt;

/// One opcode of the PEG stack machine, with its wire numbering.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
pub enum Op {
    PushUndefined = 1,
    PushNull = 2,
    PushFailed = 3,
    PushEmptyArray = 4,
    PushCurrPos = 5,
    Pop = 6,
    PopCurrPos = 7,
    PopN = 8,
    Nip = 9,
    Append = 10,
    Wrap = 11,
    Text = 12,
    If = 13,
    IfError = 14,
    IfNotError = 15,
    WhileNotError = 16,
    MatchAny = 17,
    MatchString = 18,
    MatchStringIc = 19,
    MatchCharClass = 20,
    AcceptN = 21,
    AcceptString = 22,
    Fail = 23,
    LoadSavedPos = 24,
    UpdateSavedPos = 25,
    Call = 26,
    Rule = 27,
    SilentFailsOn = 28,
    SilentFailsOff = 29,
    IfLt = 30,
    IfGe = 31,
    IfLtDynamic = 32,
    IfGeDynamic = 33,
    PushEmptyString = 35,
    Pluck = 36,
    SourceMapPush = 37,
    SourceMapPop = 38,
    SourceMapLabelPush = 39,
    SourceMapLabelPop = 40,
}

/// How an opcode is laid out in the flat stream and in the tree form.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Shape {
    /// `[op, arg1, .., argN]` with no child blocks.
    Flat,
    /// `[op, (arg,)? lenThen, lenElse, ..then.., ..else..]`.
    Cond,
    /// `[op, lenBody, ..body..]`.
    Loop,
}

/// Whether an opcode reads or overwrites the parse cursor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CurrPosUse {
    None,
    Read,
    /// Overwrites the cursor without reading it first.
    Write,
}

impl Op {
    pub fn from_code(code: i32) -> Option<Op> {
        Some(match code {
            1 => Op::PushUndefined,
            2 => Op::PushNull,
            3 => Op::PushFailed,
            4 => Op::PushEmptyArray,
            5 => Op::PushCurrPos,
            6 => Op::Pop,
            7 => Op::PopCurrPos,
            8 => Op::PopN,
            9 => Op::Nip,
            10 => Op::Append,
            11 => Op::Wrap,
            12 => Op::Text,
            13 => Op::If,
            14 => Op::IfError,
            15 => Op::IfNotError,
            16 => Op::WhileNotError,
            17 => Op::MatchAny,
            18 => Op::MatchString,
            19 => Op::MatchStringIc,
            20 => Op::MatchCharClass,
            21 => Op::AcceptN,
            22 => Op::AcceptString,
            23 => Op::Fail,
            24 => Op::LoadSavedPos,
            25 => Op::UpdateSavedPos,
            26 => Op::Call,
            27 => Op::Rule,
            28 => Op::SilentFailsOn,
            29 => Op::SilentFailsOff,
            30 => Op::IfLt,
            31 => Op::IfGe,
            32 => Op::IfLtDynamic,
            33 => Op::IfGeDynamic,
            35 => Op::PushEmptyString,
            36 => Op::Pluck,
            37 => Op::SourceMapPush,
            38 => Op::SourceMapPop,
            39 => Op::SourceMapLabelPush,
            40 => Op::SourceMapLabelPop,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::PushUndefined => "PUSH_UNDEFINED",
            Op::PushNull => "PUSH_NULL",
            Op::PushFailed => "PUSH_FAILED",
            Op::PushEmptyArray => "PUSH_EMPTY_ARRAY",
            Op::PushCurrPos => "PUSH_CURR_POS",
            Op::Pop => "POP",
            Op::PopCurrPos => "POP_CURR_POS",
            Op::PopN => "POP_N",
            Op::Nip => "NIP",
            Op::Append => "APPEND",
            Op::Wrap => "WRAP",
            Op::Text => "TEXT",
            Op::If => "IF",
            Op::IfError => "IF_ERROR",
            Op::IfNotError => "IF_NOT_ERROR",
            Op::WhileNotError => "WHILE_NOT_ERROR",
            Op::MatchAny => "MATCH_ANY",
            Op::MatchString => "MATCH_STRING",
            Op::MatchStringIc => "MATCH_STRING_IC",
            Op::MatchCharClass => "MATCH_CHAR_CLASS",
            Op::AcceptN => "ACCEPT_N",
            Op::AcceptString => "ACCEPT_STRING",
            Op::Fail => "FAIL",
            Op::LoadSavedPos => "LOAD_SAVED_POS",
            Op::UpdateSavedPos => "UPDATE_SAVED_POS",
            Op::Call => "CALL",
            Op::Rule => "RULE",
            Op::SilentFailsOn => "SILENT_FAILS_ON",
            Op::SilentFailsOff => "SILENT_FAILS_OFF",
            Op::IfLt => "IF_LT",
            Op::IfGe => "IF_GE",
            Op::IfLtDynamic => "IF_LT_DYNAMIC",
            Op::IfGeDynamic => "IF_GE_DYNAMIC",
            Op::PushEmptyString => "PUSH_EMPTY_STRING",
            Op::Pluck => "PLUCK",
            Op::SourceMapPush => "SOURCE_MAP_PUSH",
            Op::SourceMapPop => "SOURCE_MAP_POP",
            Op::SourceMapLabelPush => "SOURCE_MAP_LABEL_PUSH",
            Op::SourceMapLabelPop => "SOURCE_MAP_LABEL_POP",
        }
    }

    pub fn shape(self) -> Shape {
        match self {
            Op::If
            | Op::IfError
            | Op::IfNotError
            | Op::MatchAny
            | Op::IfLt
            | Op::IfGe
            | Op::IfLtDynamic
            | Op::IfGeDynamic
            | Op::MatchString
            | Op::MatchStringIc
            | Op::MatchCharClass => Shape::Cond,
            Op::WhileNotError => Shape::Loop,
            _ => Shape::Flat,
        }
    }

    /// Number of flag arguments of a conditional opcode.
    ///
    /// Calling this on a non-conditional opcode is a programmer error.
    pub fn cond_arg_count(self) -> usize {
        match self {
            Op::If | Op::IfError | Op::IfNotError | Op::MatchAny => 0,
            Op::IfLt
            | Op::IfGe
            | Op::IfLtDynamic
            | Op::IfGeDynamic
            | Op::MatchString
            | Op::MatchStringIc
            | Op::MatchCharClass => 1,
            other => panic!("{} is not a conditional opcode", other.name()),
        }
    }

    /// Fixed argument count of a flat opcode, or `None` when the count is
    /// encoded in the stream (`PLUCK`, `CALL`) or the opcode is structured.
    pub fn flat_arg_count(self) -> Option<usize> {
        match self {
            Op::PushUndefined
            | Op::PushNull
            | Op::PushFailed
            | Op::PushEmptyArray
            | Op::PushCurrPos
            | Op::PushEmptyString
            | Op::Pop
            | Op::PopCurrPos
            | Op::Nip
            | Op::Append
            | Op::Text
            | Op::UpdateSavedPos
            | Op::SilentFailsOn
            | Op::SilentFailsOff
            | Op::SourceMapPop => Some(0),
            Op::PopN
            | Op::Wrap
            | Op::AcceptN
            | Op::AcceptString
            | Op::Fail
            | Op::LoadSavedPos
            | Op::Rule
            | Op::SourceMapPush
            | Op::SourceMapLabelPop => Some(1),
            Op::SourceMapLabelPush => Some(3),
            Op::Pluck | Op::Call => None,
            _ => None,
        }
    }

    /// The six pushes whose only effect is one new stack value.
    pub fn is_pure_push(self) -> bool {
        matches!(
            self,
            Op::PushEmptyString
                | Op::PushUndefined
                | Op::PushNull
                | Op::PushFailed
                | Op::PushEmptyArray
                | Op::PushCurrPos
        )
    }

    /// Conservative cursor usage of a flat opcode. Structured opcodes are
    /// handled by their own interpretation paths.
    pub fn curr_pos_use(self) -> CurrPosUse {
        match self {
            Op::PopCurrPos => CurrPosUse::Write,
            Op::PushCurrPos
            | Op::Text
            | Op::UpdateSavedPos
            | Op::Fail
            | Op::AcceptN
            | Op::AcceptString
            | Op::Call
            | Op::Rule => CurrPosUse::Read,
            _ => CurrPosUse::None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[test]
fn test_code_roundtrip() {
    for code in 0..64 {
        if let Some(op) = Op::from_code(code) {
            assert_eq!(op.code(), code, "{op}");
        }
    }
    assert_eq!(Op::from_code(0), None);
    assert_eq!(Op::from_code(34), None);
    assert_eq!(Op::from_code(41), None);
}

#[test]
#[should_panic(expected = "not a conditional")]
fn test_cond_arg_count_rejects_flat_ops() {
    Op::Pop.cond_arg_count();
}
