//! The AMX instruction set.
//!
//! One table drives the enum, the mnemonic names and the operand arities,
//! so the three can never disagree.

use super::Cell;

/// How many operand cells follow an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// A fixed number of operand cells.
    Fixed(usize),
    /// `count, default, (value, address) * count`
    CaseTable,
    /// First operand is a byte length; the payload that follows is rounded
    /// up to whole cells.
    Payload,
}

macro_rules! opcodes {
    ($($variant:ident = $value:literal, $name:literal, $arity:expr;)*) => {
        /// An AMX opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum Opcode {
            $($variant = $value,)*
        }

        static OPCODES: &[Opcode] = &[$(Opcode::$variant,)*];
        static NAMES: &[&str] = &[$($name,)*];
        static ARITIES: &[Arity] = &[$($arity,)*];
    };
}

use Arity::{CaseTable, Fixed, Payload};

opcodes! {
    None = 0, "none", Fixed(0);
    LoadPri = 1, "load.pri", Fixed(1);
    LoadAlt = 2, "load.alt", Fixed(1);
    LoadSPri = 3, "load.s.pri", Fixed(1);
    LoadSAlt = 4, "load.s.alt", Fixed(1);
    LrefPri = 5, "lref.pri", Fixed(1);
    LrefAlt = 6, "lref.alt", Fixed(1);
    LrefSPri = 7, "lref.s.pri", Fixed(1);
    LrefSAlt = 8, "lref.s.alt", Fixed(1);
    LoadI = 9, "load.i", Fixed(0);
    LodbI = 10, "lodb.i", Fixed(1);
    ConstPri = 11, "const.pri", Fixed(1);
    ConstAlt = 12, "const.alt", Fixed(1);
    AddrPri = 13, "addr.pri", Fixed(1);
    AddrAlt = 14, "addr.alt", Fixed(1);
    StorPri = 15, "stor.pri", Fixed(1);
    StorAlt = 16, "stor.alt", Fixed(1);
    StorSPri = 17, "stor.s.pri", Fixed(1);
    StorSAlt = 18, "stor.s.alt", Fixed(1);
    SrefPri = 19, "sref.pri", Fixed(1);
    SrefAlt = 20, "sref.alt", Fixed(1);
    SrefSPri = 21, "sref.s.pri", Fixed(1);
    SrefSAlt = 22, "sref.s.alt", Fixed(1);
    StorI = 23, "stor.i", Fixed(0);
    StrbI = 24, "strb.i", Fixed(1);
    Lidx = 25, "lidx", Fixed(0);
    LidxB = 26, "lidx.b", Fixed(1);
    Idxaddr = 27, "idxaddr", Fixed(0);
    IdxaddrB = 28, "idxaddr.b", Fixed(1);
    AlignPri = 29, "align.pri", Fixed(1);
    AlignAlt = 30, "align.alt", Fixed(1);
    Lctrl = 31, "lctrl", Fixed(1);
    Sctrl = 32, "sctrl", Fixed(1);
    MovePri = 33, "move.pri", Fixed(0);
    MoveAlt = 34, "move.alt", Fixed(0);
    Xchg = 35, "xchg", Fixed(0);
    PushPri = 36, "push.pri", Fixed(0);
    PushAlt = 37, "push.alt", Fixed(0);
    PushR = 38, "push.r", Fixed(1);
    PushC = 39, "push.c", Fixed(1);
    Push = 40, "push", Fixed(1);
    PushS = 41, "push.s", Fixed(1);
    PopPri = 42, "pop.pri", Fixed(0);
    PopAlt = 43, "pop.alt", Fixed(0);
    Stack = 44, "stack", Fixed(1);
    Heap = 45, "heap", Fixed(1);
    Proc = 46, "proc", Fixed(0);
    Ret = 47, "ret", Fixed(0);
    Retn = 48, "retn", Fixed(0);
    Call = 49, "call", Fixed(1);
    CallPri = 50, "call.pri", Fixed(0);
    Jump = 51, "jump", Fixed(1);
    Jrel = 52, "jrel", Fixed(1);
    Jzer = 53, "jzer", Fixed(1);
    Jnz = 54, "jnz", Fixed(1);
    Jeq = 55, "jeq", Fixed(1);
    Jneq = 56, "jneq", Fixed(1);
    Jless = 57, "jless", Fixed(1);
    Jleq = 58, "jleq", Fixed(1);
    Jgrtr = 59, "jgrtr", Fixed(1);
    Jgeq = 60, "jgeq", Fixed(1);
    Jsless = 61, "jsless", Fixed(1);
    Jsleq = 62, "jsleq", Fixed(1);
    Jsgrtr = 63, "jsgrtr", Fixed(1);
    Jsgeq = 64, "jsgeq", Fixed(1);
    Shl = 65, "shl", Fixed(0);
    Shr = 66, "shr", Fixed(0);
    Sshr = 67, "sshr", Fixed(0);
    ShlCPri = 68, "shl.c.pri", Fixed(1);
    ShlCAlt = 69, "shl.c.alt", Fixed(1);
    ShrCPri = 70, "shr.c.pri", Fixed(1);
    ShrCAlt = 71, "shr.c.alt", Fixed(1);
    Smul = 72, "smul", Fixed(0);
    Sdiv = 73, "sdiv", Fixed(0);
    SdivAlt = 74, "sdiv.alt", Fixed(0);
    Umul = 75, "umul", Fixed(0);
    Udiv = 76, "udiv", Fixed(0);
    UdivAlt = 77, "udiv.alt", Fixed(0);
    Add = 78, "add", Fixed(0);
    Sub = 79, "sub", Fixed(0);
    SubAlt = 80, "sub.alt", Fixed(0);
    And = 81, "and", Fixed(0);
    Or = 82, "or", Fixed(0);
    Xor = 83, "xor", Fixed(0);
    Not = 84, "not", Fixed(0);
    Neg = 85, "neg", Fixed(0);
    Invert = 86, "invert", Fixed(0);
    AddC = 87, "add.c", Fixed(1);
    SmulC = 88, "smul.c", Fixed(1);
    ZeroPri = 89, "zero.pri", Fixed(0);
    ZeroAlt = 90, "zero.alt", Fixed(0);
    Zero = 91, "zero", Fixed(1);
    ZeroS = 92, "zero.s", Fixed(1);
    SignPri = 93, "sign.pri", Fixed(0);
    SignAlt = 94, "sign.alt", Fixed(0);
    Eq = 95, "eq", Fixed(0);
    Neq = 96, "neq", Fixed(0);
    Less = 97, "less", Fixed(0);
    Leq = 98, "leq", Fixed(0);
    Grtr = 99, "grtr", Fixed(0);
    Geq = 100, "geq", Fixed(0);
    Sless = 101, "sless", Fixed(0);
    Sleq = 102, "sleq", Fixed(0);
    Sgrtr = 103, "sgrtr", Fixed(0);
    Sgeq = 104, "sgeq", Fixed(0);
    EqCPri = 105, "eq.c.pri", Fixed(1);
    EqCAlt = 106, "eq.c.alt", Fixed(1);
    IncPri = 107, "inc.pri", Fixed(0);
    IncAlt = 108, "inc.alt", Fixed(0);
    Inc = 109, "inc", Fixed(1);
    IncS = 110, "inc.s", Fixed(1);
    IncI = 111, "inc.i", Fixed(0);
    DecPri = 112, "dec.pri", Fixed(0);
    DecAlt = 113, "dec.alt", Fixed(0);
    Dec = 114, "dec", Fixed(1);
    DecS = 115, "dec.s", Fixed(1);
    DecI = 116, "dec.i", Fixed(0);
    Movs = 117, "movs", Fixed(1);
    Cmps = 118, "cmps", Fixed(1);
    Fill = 119, "fill", Fixed(1);
    Halt = 120, "halt", Fixed(1);
    Bounds = 121, "bounds", Fixed(1);
    SysreqPri = 122, "sysreq.pri", Fixed(0);
    SysreqC = 123, "sysreq.c", Fixed(1);
    File = 124, "file", Payload;
    Line = 125, "line", Fixed(2);
    Symbol = 126, "symbol", Payload;
    Srange = 127, "srange", Fixed(2);
    JumpPri = 128, "jump.pri", Fixed(0);
    Switch = 129, "switch", Fixed(1);
    Casetbl = 130, "casetbl", CaseTable;
    SwapPri = 131, "swap.pri", Fixed(0);
    SwapAlt = 132, "swap.alt", Fixed(0);
    PushAdr = 133, "push.adr", Fixed(1);
    Nop = 134, "nop", Fixed(0);
    SysreqN = 135, "sysreq.n", Fixed(2);
    Symtag = 136, "symtag", Fixed(1);
    Break = 137, "break", Fixed(0);
}

/// Number of opcodes in the instruction set.
pub const NUM_OPCODES: usize = 138;

/// Mnemonic shown for ordinals that are not part of the instruction set.
pub const UNKNOWN_OPCODE_NAME: &str = "(unknown)";

impl Opcode {
    /// Look up an opcode by its numeric value.
    pub fn from_cell(value: Cell) -> Option<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|index| OPCODES.get(index))
            .copied()
    }

    /// All opcodes, ordered by value.
    pub fn all() -> &'static [Opcode] {
        OPCODES
    }

    pub fn name(self) -> &'static str {
        NAMES[self as usize]
    }

    pub fn arity(self) -> Arity {
        ARITIES[self as usize]
    }

    /// Whether the opcode transfers control to a code address named by its
    /// first operand.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Call
                | Opcode::Jump
                | Opcode::Jzer
                | Opcode::Jnz
                | Opcode::Jeq
                | Opcode::Jneq
                | Opcode::Jless
                | Opcode::Jleq
                | Opcode::Jgrtr
                | Opcode::Jgeq
                | Opcode::Jsless
                | Opcode::Jsleq
                | Opcode::Jsgrtr
                | Opcode::Jsgeq
        )
    }
}

/// Mnemonic for a raw opcode ordinal; out-of-range ordinals get a placeholder.
pub fn opcode_name(ordinal: Cell) -> &'static str {
    Opcode::from_cell(ordinal)
        .map(Opcode::name)
        .unwrap_or(UNKNOWN_OPCODE_NAME)
}
