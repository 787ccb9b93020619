/// Op codes from §6, numbered exactly as enumerated there so the wire bytes
/// match the spec's table verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Op {
    Pull = 1,
    Push = 2,
    Pulle = 3,
    Pushe = 4,
    Pulleinfo = 5,
    Eval = 6,
    Fin = 7,
    Term = 8,
    Resp = 9,
    /// Weight-server-only: set `expectedTotal` for the current round.
    Info = 10,
}

impl Op {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Op::Pull),
            2 => Some(Op::Push),
            3 => Some(Op::Pulle),
            4 => Some(Op::Pushe),
            5 => Some(Op::Pulleinfo),
            6 => Some(Op::Eval),
            7 => Some(Op::Fin),
            8 => Some(Op::Term),
            9 => Some(Op::Resp),
            10 => Some(Op::Info),
            _ => None,
        }
    }
}
