//! The emitted Lua prelude.
//!
//! Pure helpers the generated code calls directly: truthiness and integer
//! coercion, the string coercion set (`CHR_STRING`, `ASC`, `STR_STRING`,
//! `VAL`, `HEX_STRING`, `BIN_STRING`, `OCT_STRING`), the `BASIC_*` math and
//! string functions the core registry targets, array construction, and the
//! operand stack used by non-reconstructed sequences. Host-side operations
//! (`terminal_*`, `file_*`, `data_*`, timers, `basic_pump_events`,
//! `check_should_stop`) are plain globals the embedding runtime registers
//! before the chunk runs.

pub const PRELUDE: &str = r#"local function __bool(v)
  if type(v) == "number" then return v ~= 0 end
  return not not v
end
local function __toint(v)
  if type(v) ~= "number" then return 0 end
  if v >= 0 then return math.floor(v) end
  return math.ceil(v)
end
local function __bits(v)
  return math.tointeger(v) or __toint(v)
end
local __stack = {}
local __sp = 0
local function __push(v)
  __sp = __sp + 1
  __stack[__sp] = v
end
local function __pop()
  local v = __stack[__sp]
  __stack[__sp] = nil
  __sp = __sp - 1
  return v
end
local __gosub = {}

local function BASIC_IDIV(a, b)
  return __toint(__toint(a) / __toint(b))
end
local function BASIC_MOD(a, b)
  a = __toint(a)
  b = __toint(b)
  return a - BASIC_IDIV(a, b) * b
end
local function BASIC_SGN(n)
  if n > 0 then return 1 elseif n < 0 then return -1 end
  return 0
end
local function BASIC_FIX(n)
  return __toint(n)
end
local function BASIC_RND(n)
  if n ~= nil and n < 0 then math.randomseed(-n) end
  return math.random()
end
local function BASIC_RANDOMIZE(seed)
  if seed == nil or seed == 0 then
    math.randomseed(os.time())
  else
    math.randomseed(seed)
  end
end
local function BASIC_TIMER()
  return os.clock()
end

local function BASIC_LEN(s)
  return #s
end
local function BASIC_LEFT(s, n)
  if n <= 0 then return "" end
  return string.sub(s, 1, n)
end
local function BASIC_RIGHT(s, n)
  if n <= 0 then return "" end
  return string.sub(s, -n)
end
local function BASIC_MID(s, start, length)
  if length == nil or length < 0 then return string.sub(s, start) end
  return string.sub(s, start, start + length - 1)
end
local function CHR_STRING(code)
  return string.char(__toint(code) % 256)
end
local function ASC(s)
  return string.byte(s, 1) or 0
end
local function STR_STRING(n)
  local text
  if math.type(n) == "integer" or (type(n) == "number" and n % 1 == 0) then
    text = string.format("%d", n)
  else
    text = tostring(n)
  end
  if n >= 0 then return " " .. text end
  return text
end
local function VAL(s)
  return tonumber(s) or tonumber(string.match(s, "^%s*[-+]?%d*%.?%d*")) or 0
end
local function HEX_STRING(n)
  return string.format("%X", __bits(n))
end
local function OCT_STRING(n)
  return string.format("%o", __bits(n))
end
local function BIN_STRING(n)
  local v = __bits(n)
  if v == 0 then return "0" end
  local digits = {}
  local negative = v < 0
  if negative then v = -v end
  while v > 0 do
    table.insert(digits, 1, tostring(v % 2))
    v = v // 2
  end
  if negative then return "-" .. table.concat(digits) end
  return table.concat(digits)
end
local function BASIC_UCASE(s)
  return string.upper(s)
end
local function BASIC_LCASE(s)
  return string.lower(s)
end
local function BASIC_TRIM(s)
  return (string.gsub(s, "^%s*(.-)%s*$", "%1"))
end
local function BASIC_LTRIM(s)
  return (string.gsub(s, "^%s*", ""))
end
local function BASIC_RTRIM(s)
  return (string.gsub(s, "%s*$", ""))
end
local function BASIC_SPACE(n)
  return string.rep(" ", math.max(0, __toint(n)))
end
local function BASIC_STRING(n, fill)
  local c
  if type(fill) == "string" then c = string.sub(fill, 1, 1) else c = string.char(__toint(fill) % 256) end
  return string.rep(c, math.max(0, __toint(n)))
end
local function BASIC_INSTR(s, find, start)
  local from = start or 1
  if from < 1 then from = 1 end
  local found = string.find(s, find, from, true)
  return found or 0
end
local function BASIC_TAB(n)
  return string.rep(" ", math.max(0, __toint(n)))
end

local function BASIC_DIM(init, base, ...)
  local dims = { ... }
  local function build(axis)
    local size = __toint(dims[axis]) - base + 1
    local t = {}
    if axis == #dims then
      for i = 1, size do t[i] = init end
    else
      for i = 1, size do t[i] = build(axis + 1) end
    end
    return t
  end
  if #dims == 0 then return {} end
  return build(1)
end
local function BASIC_REDIM(old, init, base, ...)
  local fresh = BASIC_DIM(init, base, ...)
  if old ~= nil then
    local function copy(src, dst)
      for i, v in ipairs(src) do
        if dst[i] ~= nil then
          if type(v) == "table" and type(dst[i]) == "table" then
            copy(v, dst[i])
          elseif type(v) ~= "table" then
            dst[i] = v
          end
        end
      end
    end
    copy(old, fresh)
  end
  return fresh
end
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prelude_defines_the_protocol_coercions() {
        for name in [
            "CHR_STRING",
            "ASC",
            "STR_STRING",
            "VAL",
            "HEX_STRING",
            "BIN_STRING",
            "OCT_STRING",
        ] {
            assert!(
                PRELUDE.contains(&format!("function {}", name)),
                "missing {}",
                name
            );
        }
    }

    #[test]
    fn prelude_defines_stack_and_arrays() {
        assert!(PRELUDE.contains("function __push"));
        assert!(PRELUDE.contains("function __pop"));
        assert!(PRELUDE.contains("function BASIC_DIM"));
        assert!(PRELUDE.contains("function BASIC_REDIM"));
        assert!(PRELUDE.contains("local __gosub"));
    }
}
