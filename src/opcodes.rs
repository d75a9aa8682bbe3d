//! Named opcode identifiers (spec.md §4.E). The spesh graph hands the
//! builder/emitter raw `u16` opcode ids; this table is the single place
//! that attaches names to them so dispatch reads as a match on intent
//! rather than on magic numbers.

pub const CONST_I64_16: u16 = 0;
pub const CONST_I64: u16 = 1;
pub const CONST_N64: u16 = 2;
pub const CONST_S: u16 = 3;
pub const NULL: u16 = 4;
pub const GETHOW: u16 = 5;
pub const GETWHAT: u16 = 6;
pub const GETLEX: u16 = 7;
pub const BINDLEX: u16 = 8;
pub const SP_GETARG_I: u16 = 9;
pub const SP_GETARG_N: u16 = 10;
pub const SP_GETARG_S: u16 = 11;
pub const SP_GETARG_O: u16 = 12;
pub const SP_P6OGET_I: u16 = 13;
pub const SP_P6OGET_N: u16 = 14;
pub const SP_P6OGET_S: u16 = 15;
pub const SP_P6OGET_O: u16 = 16;
pub const SP_P6OGET_VT_O: u16 = 17;
pub const SP_P6OGET_VC_O: u16 = 18;
pub const SP_P6OBIND_I: u16 = 19;
pub const SP_P6OBIND_N: u16 = 20;
pub const SP_P6OBIND_S: u16 = 21;
pub const SP_P6OBIND_O: u16 = 22;
pub const SET: u16 = 23;
pub const GETWHERE: u16 = 24;
pub const SP_GETSPESHSLOT: u16 = 25;
pub const SETDISPATCHER: u16 = 26;
pub const TAKEDISPATCHER: u16 = 27;
pub const GETCODE: u16 = 28;
pub const ADD_I: u16 = 29;
pub const SUB_I: u16 = 30;
pub const MUL_I: u16 = 31;
pub const DIV_I: u16 = 32;
pub const MOD_I: u16 = 33;
pub const INC_I: u16 = 34;
pub const DEC_I: u16 = 35;
pub const ADD_N: u16 = 36;
pub const SUB_N: u16 = 37;
pub const MUL_N: u16 = 38;
pub const DIV_N: u16 = 39;
pub const COERCE_IN: u16 = 40;
pub const COERCE_NI: u16 = 41;
pub const EQ_I: u16 = 42;
pub const NE_I: u16 = 43;
pub const LT_I: u16 = 44;
pub const LE_I: u16 = 45;
pub const GT_I: u16 = 46;
pub const GE_I: u16 = 47;
pub const EQADDR: u16 = 48;
pub const SP_FASTCREATE: u16 = 49;
