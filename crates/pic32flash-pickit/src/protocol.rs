//! PICkit2/PICkit3 command and script opcodes (the subset the PIC32
//! programming flow uses).

/// Report size of every transfer in both directions.
pub const REPORT_SIZE: usize = 64;

// Commands.
pub const CMD_GET_VERSION: u8 = 0x76;
pub const CMD_GETVERSIONS_MPLAB: u8 = 0x41;
pub const CMD_SET_VDD: u8 = 0xa0;
pub const CMD_SET_VPP: u8 = 0xa1;
pub const CMD_READ_STATUS: u8 = 0xa2;
pub const CMD_EXECUTE_SCRIPT: u8 = 0xa6;
pub const CMD_CLEAR_DOWNLOAD_BUFFER: u8 = 0xa7;
pub const CMD_DOWNLOAD_DATA: u8 = 0xa8;
pub const CMD_CLEAR_UPLOAD_BUFFER: u8 = 0xa9;
pub const CMD_UPLOAD_DATA: u8 = 0xaa;
pub const CMD_UPLOAD_DATA_NOLEN: u8 = 0xac;
pub const CMD_END_OF_BUFFER: u8 = 0xad;

// Status bits.
pub const STATUS_VDD_GND_ON: u16 = 0x0001;
pub const STATUS_VDD_ON: u16 = 0x0002;
pub const STATUS_VPP_GND_ON: u16 = 0x0004;
pub const STATUS_VPP_ON: u16 = 0x0008;
pub const STATUS_BUTTON_PRESSED: u16 = 0x0040;
pub const STATUS_RESET: u16 = 0x0100;
pub const STATUS_ICD_TIMEOUT: u16 = 0x0400;

// Script instructions.
pub const SCRIPT_JT2_WAIT_PE_RESP: u8 = 0xb4;
pub const SCRIPT_JT2_GET_PE_RESP: u8 = 0xb5;
pub const SCRIPT_JT2_XFERINST_BUF: u8 = 0xb6;
pub const SCRIPT_JT2_XFRFASTDAT_BUF: u8 = 0xb7;
pub const SCRIPT_JT2_XFRFASTDAT_LIT: u8 = 0xb8;
pub const SCRIPT_JT2_XFERDATA32_LIT: u8 = 0xb9;
pub const SCRIPT_JT2_XFERDATA8_LIT: u8 = 0xba;
pub const SCRIPT_JT2_SENDCMD: u8 = 0xbb;
pub const SCRIPT_JT2_SETMODE: u8 = 0xbc;
pub const SCRIPT_DELAY_SHORT: u8 = 0xe7;
pub const SCRIPT_DELAY_LONG: u8 = 0xe8;
pub const SCRIPT_LOOP: u8 = 0xe9;
pub const SCRIPT_SET_ICSP_SPEED: u8 = 0xea;
pub const SCRIPT_WRITE_BYTE_LITERAL: u8 = 0xf2;
pub const SCRIPT_SET_ICSP_PINS: u8 = 0xf3;
pub const SCRIPT_BUSY_LED_OFF: u8 = 0xf4;
pub const SCRIPT_BUSY_LED_ON: u8 = 0xf5;
pub const SCRIPT_MCLR_GND_OFF: u8 = 0xf6;
pub const SCRIPT_MCLR_GND_ON: u8 = 0xf7;
pub const SCRIPT_VPP_PWM_OFF: u8 = 0xf8;
pub const SCRIPT_VPP_PWM_ON: u8 = 0xf9;
pub const SCRIPT_VPP_OFF: u8 = 0xfa;
pub const SCRIPT_VPP_ON: u8 = 0xfb;
pub const SCRIPT_VDD_GND_OFF: u8 = 0xfc;
pub const SCRIPT_VDD_GND_ON: u8 = 0xfd;
pub const SCRIPT_VDD_OFF: u8 = 0xfe;
pub const SCRIPT_VDD_ON: u8 = 0xff;
