pub mod kiwoom;
